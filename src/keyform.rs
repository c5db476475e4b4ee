//! Key forms: shape constraints over keys.
//!
//! A [`KeyForm`] pairs a key with a height for each of its open leaves
//! (arity-0 nodes). A key matches the form when the form's key aligns
//! inside it and the subtree hanging under each aligned open leaf has
//! uniform depth equal to the leaf's height. Forms order by coverage:
//! `a <= b` when every key matching `b` can be reduced onto `a`.
//!
//! In string renderings a height of `h` appears as a descent chain of `h`
//! wildcard (`?`) nodes under the leaf. [`KeyForm::new`] folds such chains
//! out of the key and into the height vector; [`KeyForm::as_key`] expands
//! them back.

use std::collections::{HashMap, VecDeque};

use crate::error::StructuralError;
use crate::key::{Key, KeyNode, WILDCARD};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyForm {
    key: Key,
    heights: Vec<usize>,
}

impl KeyForm {
    /// Build a form from a key and one height per open leaf. Wildcard
    /// descent chains in the key are folded into the heights of the leaves
    /// they hang under.
    pub fn new(key: Key, heights: Vec<usize>) -> Result<KeyForm, StructuralError> {
        let leaves = key.nodes().iter().filter(|n| n.arity == 0).count();
        if heights.len() != leaves {
            return Err(StructuralError::HeightMismatch {
                expected: leaves,
                got: heights.len(),
            });
        }
        let (key, heights) = strip(&key, &heights)?;
        Ok(KeyForm { key, heights })
    }

    /// The form matching `key` exactly, with zero heights.
    pub fn from_key(key: &Key) -> Result<KeyForm, StructuralError> {
        let leaves = key.nodes().iter().filter(|n| n.arity == 0).count();
        KeyForm::new(key.clone(), vec![0; leaves])
    }

    /// The universal aggregate form: every key reduces to the root.
    pub fn agg() -> KeyForm {
        KeyForm {
            key: Key::root(),
            heights: vec![0],
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn heights(&self) -> &[usize] {
        &self.heights
    }

    /// Expand the height vector back into wildcard descent chains.
    pub fn as_key(&self) -> Key {
        let children = adjacency(&self.key);
        let mut out: Vec<KeyNode> = Vec::new();
        let mut queue: VecDeque<Item> = VecDeque::new();
        let mut leaf = 0;
        queue.push_back(Item::Real(0));
        while let Some(item) = queue.pop_front() {
            match item {
                Item::Real(i) => {
                    let arity = self.key.arity(i);
                    if arity == 0 {
                        let h = self.heights[leaf];
                        leaf += 1;
                        if h > 0 {
                            out.push(KeyNode::new(self.key.label(i), 1));
                            queue.push_back(Item::Wild(h - 1));
                        } else {
                            out.push(KeyNode::new(self.key.label(i), 0));
                        }
                    } else {
                        out.push(KeyNode::new(self.key.label(i), arity));
                        for &c in &children[i] {
                            queue.push_back(Item::Real(c));
                        }
                    }
                }
                Item::Wild(rem) => {
                    if rem > 0 {
                        out.push(KeyNode::new(WILDCARD, 1));
                        queue.push_back(Item::Wild(rem - 1));
                    } else {
                        out.push(KeyNode::new(WILDCARD, 0));
                    }
                }
            }
        }
        Key::from_nodes(out)
    }

    /// True iff `key` is exactly in the extent of this form.
    pub fn contains(&self, key: &Key) -> bool {
        self.reduce(key, None).map_or(false, |r| r == *key)
    }

    /// Coverage order: `self.le(other)` iff every key of `other`'s extent
    /// projects onto `self`.
    pub fn le(&self, other: &KeyForm) -> bool {
        let matches = self.key.find_in(&other.key, None);
        let m = match matches.first() {
            Some(m) => m,
            None => return false,
        };
        let inv: HashMap<usize, usize> =
            m.iter().enumerate().map(|(i_s, &i_o)| (i_o, i_s)).collect();
        let self_ord = leaf_ordinals(&self.key);
        let mut s = 1;
        let mut other_leaf = 0;
        let mut depths: HashMap<usize, usize> = HashMap::new();
        let mut refs: HashMap<usize, usize> = HashMap::new();
        for (i, node) in other.key.nodes().iter().enumerate() {
            if let Some(&i_s) = inv.get(&i) {
                let degree_s = self.key.arity(i_s);
                if degree_s == 0 {
                    depths.insert(i, 0);
                    refs.insert(i, self.heights[self_ord[&i_s]]);
                } else if node.arity < degree_s {
                    return false;
                }
            }
            if let Some(&d) = depths.get(&i) {
                let r = refs[&i];
                for j in 0..node.arity {
                    depths.insert(s + j, d + 1);
                    refs.insert(s + j, r);
                }
                if node.arity == 0 && d + other.heights[other_leaf] < r {
                    return false;
                }
            }
            if node.arity == 0 {
                other_leaf += 1;
            }
            s += node.arity;
        }
        true
    }

    pub fn lt(&self, other: &KeyForm) -> bool {
        self != other && self.le(other)
    }

    /// Project `key` onto this form: keep the aligned nodes and, under each
    /// open leaf of height `h`, the subtree down to depth `h`, truncating
    /// anything deeper. Fails when no alignment exists, when the branch is
    /// out of range, when no branch is given and several alignments exist,
    /// or when a kept subtree is shallower than the leaf's height.
    pub fn reduce(&self, key: &Key, branch: Option<usize>) -> Result<Key, StructuralError> {
        let matches = self.key.find_in(key, None);
        if matches.is_empty() {
            return Err(StructuralError::NoMatch(format!(
                "key '{}' does not match form '{}'",
                key, self
            )));
        }
        let m = match branch {
            None if matches.len() > 1 => {
                return Err(StructuralError::Ambiguous(format!(
                    "key '{}' matches form '{}' at {} branches",
                    key,
                    self,
                    matches.len()
                )))
            }
            None => &matches[0],
            Some(b) => matches
                .get(b)
                .ok_or(StructuralError::InvalidBranch(b))?,
        };
        let inv: HashMap<usize, usize> =
            m.iter().enumerate().map(|(i_s, &i_k)| (i_k, i_s)).collect();
        let self_ord = leaf_ordinals(&self.key);
        let mut s = 1;
        let mut result: Vec<KeyNode> = Vec::new();
        let mut trim: HashMap<usize, usize> = HashMap::new();
        for (i, node) in key.nodes().iter().enumerate() {
            if let Some(&i_s) = inv.get(&i) {
                let degree_s = self.key.arity(i_s);
                if degree_s == 0 {
                    let h = self.heights[self_ord[&i_s]];
                    if h == 0 {
                        result.push(KeyNode::new(node.label.clone(), 0));
                    } else if node.arity == 0 {
                        return Err(StructuralError::NoMatch(format!(
                            "subtree under '{}' in key '{}' is shallower than its form height",
                            node.label, key
                        )));
                    } else {
                        result.push(KeyNode::new(node.label.clone(), node.arity));
                        for j in 0..node.arity {
                            trim.insert(s + j, h - 1);
                        }
                    }
                } else {
                    result.push(KeyNode::new(node.label.clone(), degree_s));
                }
            } else if let Some(&h) = trim.get(&i) {
                if h == 0 {
                    result.push(KeyNode::new(node.label.clone(), 0));
                } else if node.arity == 0 {
                    return Err(StructuralError::NoMatch(format!(
                        "subtree under '{}' in key '{}' is shallower than its form height",
                        node.label, key
                    )));
                } else {
                    result.push(KeyNode::new(node.label.clone(), node.arity));
                    for j in 0..node.arity {
                        trim.insert(s + j, h - 1);
                    }
                }
            }
            s += node.arity;
        }
        Ok(Key::from_nodes(result))
    }

    /// Build a reductor projecting keys of `source`'s extent onto this
    /// form. Fails when this form does not align inside `source` at all.
    pub fn reductor(&self, source: &KeyForm) -> Result<Reductor, StructuralError> {
        let matches = self.key.find_in(&source.key, None);
        if matches.is_empty() {
            return Err(StructuralError::NoMatch(format!(
                "form '{}' does not align inside '{}'",
                self, source
            )));
        }
        Ok(Reductor {
            form: self.clone(),
            branch: None,
        })
    }
}

impl std::fmt::Display for KeyForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// A reusable projection of keys onto a form, optionally pinned to one
/// alignment branch.
#[derive(Clone, Debug)]
pub struct Reductor {
    form: KeyForm,
    branch: Option<usize>,
}

impl Reductor {
    pub fn new(form: KeyForm, branch: Option<usize>) -> Reductor {
        Reductor { form, branch }
    }

    pub fn form(&self) -> &KeyForm {
        &self.form
    }

    pub fn apply(&self, key: &Key) -> Result<Key, StructuralError> {
        self.form.reduce(key, self.branch)
    }
}

enum Item {
    Real(usize),
    Wild(usize),
}

/// Child index lists per node, from the level-order layout.
fn adjacency(key: &Key) -> Vec<Vec<usize>> {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); key.len()];
    let mut s = 1;
    for i in 0..key.len() {
        for j in 0..key.arity(i) {
            children[i].push(s + j);
        }
        s += key.arity(i);
    }
    children
}

/// Open-leaf ordinal per node position, in level order.
fn leaf_ordinals(key: &Key) -> HashMap<usize, usize> {
    let mut ord = HashMap::new();
    let mut next = 0;
    for i in 0..key.len() {
        if key.arity(i) == 0 {
            ord.insert(i, next);
            next += 1;
        }
    }
    ord
}

/// Fold wildcard descent chains into leaf heights. A chain is a run of
/// arity-1 `?` nodes ending in an arity-0 `?`, hanging as the sole child of
/// a non-wildcard node; any other occurrence of `?` is malformed.
fn strip(key: &Key, heights: &[usize]) -> Result<(Key, Vec<usize>), StructuralError> {
    let n = key.len();
    let children = adjacency(key);
    let leaf_ord = leaf_ordinals(key);

    let mut folded: HashMap<usize, usize> = HashMap::new();
    for i in 0..n {
        if key.label(i) == WILDCARD {
            continue;
        }
        let kids = &children[i];
        if kids.len() == 1 && key.label(kids[0]) == WILDCARD {
            let mut len = 0;
            let mut cur = kids[0];
            loop {
                if key.label(cur) != WILDCARD || key.arity(cur) > 1 {
                    return Err(StructuralError::InvalidWildcard(key.to_string()));
                }
                len += 1;
                if key.arity(cur) == 0 {
                    folded.insert(i, len + heights[leaf_ord[&cur]]);
                    break;
                }
                cur = children[cur][0];
            }
        } else if kids.iter().any(|&c| key.label(c) == WILDCARD) {
            return Err(StructuralError::InvalidWildcard(key.to_string()));
        } else if kids.is_empty() {
            folded.insert(i, heights[leaf_ord[&i]]);
        }
    }

    // Rebuild in level order, skipping folded chains.
    let mut out_nodes: Vec<KeyNode> = Vec::new();
    let mut out_heights: Vec<usize> = Vec::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    queue.push_back(0);
    while let Some(i) = queue.pop_front() {
        let kids: &[usize] = if folded.contains_key(&i) {
            &[]
        } else {
            &children[i]
        };
        out_nodes.push(KeyNode::new(key.label(i), kids.len()));
        if let Some(&h) = folded.get(&i) {
            out_heights.push(h);
        }
        for &c in kids {
            queue.push_back(c);
        }
    }
    Ok((Key::from_nodes(out_nodes), out_heights))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn form(s: &str) -> KeyForm {
        let k = key(s);
        KeyForm::from_key(&k).unwrap()
    }

    #[test]
    fn wildcard_chains_fold_into_heights() {
        let f = form("a:?:?");
        assert_eq!(f.key(), &key("a"));
        assert_eq!(f.heights(), &[2]);
        assert_eq!(f.as_key(), key("a:?:?"));
    }

    #[test]
    fn mixed_wildcards_are_rejected() {
        assert!(KeyForm::from_key(&key("a:(b,?)")).is_err());
        assert!(KeyForm::from_key(&key("a:?:(b,c)")).is_err());
    }

    #[test]
    fn folding_reorders_heights_by_level() {
        // Folding lifts the open leaf above nodes that stay deeper.
        let f = KeyForm::new(key("(a,b):(?,c)"), vec![0, 0]).unwrap();
        assert_eq!(f.key(), &key("(a,b):(,c)"));
        assert_eq!(f.heights(), &[1, 0]);
    }

    #[test]
    fn height_vector_length_is_checked() {
        assert!(matches!(
            KeyForm::new(key("(a,b)"), vec![0]),
            Err(StructuralError::HeightMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn containment_requires_exact_depth() {
        let f = form("a:?");
        assert!(f.contains(&key("a:b")));
        assert!(!f.contains(&key("a")));
        assert!(!f.contains(&key("a:b:c")));
        assert!(!f.contains(&key("b:c")));
    }

    #[test]
    fn agg_form_contains_only_root() {
        let f = KeyForm::agg();
        assert!(f.contains(&Key::root()));
        assert!(!f.contains(&key("a")));
        assert_eq!(f.reduce(&key("a:(b,c)"), None).unwrap(), Key::root());
    }

    #[test]
    fn reduce_truncates_below_heights() {
        let f = form("a:?");
        assert_eq!(f.reduce(&key("a:b:c"), None).unwrap(), key("a:b"));
        assert_eq!(f.reduce(&key("a:(b,c)"), None).unwrap(), key("a:(b,c)"));
    }

    #[test]
    fn reduce_fails_on_shallow_keys() {
        let f = form("a:?:?");
        assert!(matches!(
            f.reduce(&key("a:b"), None),
            Err(StructuralError::NoMatch(_))
        ));
    }

    #[test]
    fn reduce_demands_branch_when_ambiguous() {
        let f = form("x:?");
        let k = key("(x,x):(c,d)");
        assert!(matches!(
            f.reduce(&k, None),
            Err(StructuralError::Ambiguous(_))
        ));
        assert!(f.reduce(&k, Some(0)).is_ok());
        assert!(f.reduce(&k, Some(1)).is_ok());
        assert!(matches!(
            f.reduce(&k, Some(2)),
            Err(StructuralError::InvalidBranch(2))
        ));
    }

    #[test]
    fn coverage_order() {
        let wide = form("a:?:?");
        let narrow = form("a:?");
        let agg = KeyForm::agg();
        assert!(agg.le(&wide));
        assert!(agg.le(&narrow));
        assert!(agg.le(&agg));
        assert!(narrow.lt(&wide));
        assert!(!wide.le(&narrow));
        assert!(wide.le(&wide) && !wide.lt(&wide));
    }

    #[test]
    fn reductor_validates_alignment() {
        let by = form("b:?");
        let src = form("a:?");
        assert!(by.reductor(&src).is_err());
        assert!(KeyForm::agg().reductor(&src).is_ok());
    }
}
