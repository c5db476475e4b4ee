//! Symbolic hierarchical addresses.
//!
//! A [`Key`] is an immutable sequence of (label, arity) pairs laid out in
//! level order: the root first, then all level-1 nodes left to right, then
//! all level-2 nodes, and so on. The children of the node at position `i`
//! occupy positions `S + 1 ..= S + arity`, where `S` is the sum of the
//! arities of all nodes before `i`. The root carries the empty label; every
//! other label is a name drawn from a namespace tree or the wildcard marker
//! `?`.
//!
//! Keys render to and parse from a compact colon/paren grammar: levels are
//! colon-separated, and sibling groups of two or more are parenthesized and
//! comma-separated, wrapped by the parens of every branching ancestor. The
//! rendering of `Display` round-trips exactly through [`Key::parse`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::error::{StructuralError, SyntaxError};
use crate::parser;

/// The label an open form leaf expands to.
pub const WILDCARD: &str = "?";

/// One node of a key: a label and the number of children.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyNode {
    pub label: String,
    pub arity: usize,
}

impl KeyNode {
    pub fn new(label: impl Into<String>, arity: usize) -> Self {
        KeyNode {
            label: label.into(),
            arity,
        }
    }
}

/// An immutable hierarchical address.
///
/// Ordering and hashing are structural (by node sequence); the containment
/// relation of the key algebra is [`Key::is_in`], not `<=`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    nodes: Rc<[KeyNode]>,
}

impl Key {
    /// The bare root key, rendered as the empty string.
    pub fn root() -> Key {
        Key {
            nodes: Rc::from(vec![KeyNode::new("", 0)]),
        }
    }

    /// Parse a key from its string rendering.
    pub fn parse(s: &str) -> Result<Key, SyntaxError> {
        parser::parse_key(s)
    }

    /// Build a key from explicit (label, arity) pairs, validating that the
    /// arity sequence describes a single level-order tree.
    pub fn new(pairs: Vec<(String, usize)>) -> Result<Key, StructuralError> {
        let nodes: Vec<KeyNode> = pairs
            .into_iter()
            .map(|(label, arity)| KeyNode::new(label, arity))
            .collect();
        let total: usize = nodes.iter().map(|n| n.arity).sum();
        if nodes.is_empty() || nodes.len() != total + 1 {
            return Err(StructuralError::InvalidChildList);
        }
        // Children must come strictly after their parent in level order.
        let mut s = 0;
        for (i, node) in nodes.iter().enumerate() {
            if s < i {
                return Err(StructuralError::InvalidChildList);
            }
            s += node.arity;
        }
        Ok(Key {
            nodes: Rc::from(nodes),
        })
    }

    pub(crate) fn from_nodes(nodes: Vec<KeyNode>) -> Key {
        debug_assert!(!nodes.is_empty());
        Key {
            nodes: Rc::from(nodes),
        }
    }

    pub fn nodes(&self) -> &[KeyNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// One less than the node count.
    pub fn size(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_root(&self) -> bool {
        self.size() == 0
    }

    pub fn label(&self, i: usize) -> &str {
        &self.nodes[i].label
    }

    pub fn arity(&self, i: usize) -> usize {
        self.nodes[i].arity
    }

    /// Depth of the node tree below the root.
    pub fn height(&self) -> usize {
        let mut s = 1;
        let mut lvs: Vec<usize> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if s == 1 || lvs.last() == Some(&i) {
                lvs.push(s);
            }
            s += node.arity;
        }
        lvs.len() - 1
    }

    /// Every alignment of `self` inside `other`.
    ///
    /// An alignment maps each node of `self` to a node of `other` with the
    /// same label (or any label, where `self`'s label equals `wildcard`)
    /// such that each aligned node's aligned children are a subset of the
    /// target node's children. The scan runs over `other` in reverse,
    /// extending candidate alignments one `self` node at a time.
    pub fn find_in(&self, other: &Key, wildcard: Option<&str>) -> Vec<Vec<usize>> {
        let n_s = self.len();
        let n_o = other.len();
        if n_o < n_s {
            return Vec::new();
        }
        let matched = |label_s: &str, label_o: &str| {
            label_s == label_o || wildcard.map_or(false, |w| label_s == w)
        };
        let mut z_o = 0;
        let mut matches: VecDeque<BTreeMap<usize, usize>> = VecDeque::new();
        let mut zs: VecDeque<usize> = VecDeque::new();
        for back in 0..n_o {
            let i_o = n_o - back - 1;
            let node_o = &other.nodes[i_o];
            z_o += node_o.arity;
            let children: HashSet<usize> = (0..node_o.arity).map(|j| n_o - z_o + j).collect();
            for (m, z_s) in matches.iter_mut().zip(zs.iter_mut()) {
                let i_s = n_s - m.len() - 1;
                let node_s = &self.nodes[i_s];
                if matched(&node_s.label, &node_o.label) {
                    let z_new = *z_s + node_s.arity;
                    let req: HashSet<usize> = (0..node_s.arity)
                        .map(|j| m[&(n_s - z_new + j)])
                        .collect();
                    if req.is_subset(&children) {
                        m.insert(i_s, i_o);
                        *z_s = z_new;
                    }
                }
            }
            if n_s - 1 <= i_o && matched(&self.nodes[n_s - 1].label, &node_o.label) {
                let mut seed = BTreeMap::new();
                seed.insert(n_s - 1, i_o);
                matches.push_front(seed);
                zs.push_front(0);
            }
        }
        matches
            .into_iter()
            .filter(|m| m.len() == n_s)
            .map(|m| (0..n_s).map(|i| m[&i]).collect())
            .collect()
    }

    /// True iff `self` occurs as a structurally aligned sub-pattern of
    /// `other`.
    pub fn is_in(&self, other: &Key) -> bool {
        !self.find_in(other, None).is_empty()
    }

    /// Split off the children of node `n` named by `m` (all children when
    /// `m` is empty) as a standalone key rooted at a fresh empty node,
    /// leaving a remainder in which node `n` keeps only the other children.
    pub fn cut(&self, n: usize, m: &[usize]) -> Result<(Key, Key), StructuralError> {
        if n == 0 && m.is_empty() {
            return Ok((Key::root(), self.clone()));
        }
        if n >= self.len() {
            return Err(StructuralError::InvalidNode(n, self.to_string()));
        }
        let label = self.nodes[n].label.clone();
        let degree = self.nodes[n].arity;
        for &i in m {
            if i >= degree {
                return Err(StructuralError::InvalidChild(i));
            }
        }
        let picks: Vec<usize> = if m.is_empty() {
            (0..degree).collect()
        } else {
            m.to_vec()
        };
        let s0: usize = self.nodes[..n].iter().map(|nd| nd.arity).sum();
        let mut indices: HashSet<usize> = picks.iter().map(|&j| s0 + j + 1).collect();
        let mut s = s0 + degree;
        let mut l: Vec<KeyNode> = self.nodes[..n].to_vec();
        l.push(KeyNode::new(label, degree - picks.len()));
        let mut r: Vec<KeyNode> = vec![KeyNode::new("", picks.len())];
        for (i, node) in self.nodes.iter().enumerate().skip(n + 1) {
            if indices.contains(&i) {
                r.push(node.clone());
                for j in 0..node.arity {
                    indices.insert(s + j + 1);
                }
            } else {
                l.push(node.clone());
            }
            s += node.arity;
        }
        Ok((Key::from_nodes(l), Key::from_nodes(r)))
    }

    /// Splice `other` (rooted at an anonymous node) into node `n` of `self`
    /// at the child slots named by `m`; the inverse of [`Key::cut`]:
    /// `a.link(&inner, n, m)` restores `a` when `(outer, inner)` came from
    /// `a.cut(n, m)` and `a == outer.link(...)`.
    pub fn link(&self, other: &Key, n: usize, m: &[usize]) -> Result<Key, StructuralError> {
        if n >= self.len() {
            return Err(StructuralError::InvalidNode(n, self.to_string()));
        }
        let label_n = self.nodes[n].label.clone();
        let degree_s = self.nodes[n].arity;
        let degree_o = other.nodes[0].arity;
        let degree_n = degree_s + degree_o;
        if !m.is_empty() && m.len() != degree_o {
            return Err(StructuralError::InvalidChildList);
        }
        for &i in m {
            if i >= degree_n {
                return Err(StructuralError::InvalidChild(i));
            }
        }
        let mut s = 0;
        let mut result: Vec<KeyNode> = Vec::with_capacity(self.len() + other.len() - 1);
        for node in &self.nodes[..n] {
            s += node.arity;
            result.push(node.clone());
        }
        let picks: Vec<usize> = if m.is_empty() {
            (0..degree_o).map(|j| degree_s + j).collect()
        } else {
            m.to_vec()
        };
        let mut indices: HashSet<usize> = picks.iter().map(|&j| s + j + 1).collect();
        s += degree_n;
        result.push(KeyNode::new(label_n, degree_n));
        let mut l: VecDeque<KeyNode> = self.nodes[n + 1..].iter().cloned().collect();
        let mut r: VecDeque<KeyNode> = other.nodes[1..].iter().cloned().collect();
        for i in (n + 1)..(self.len() + other.len() - 1) {
            let take_r = indices.contains(&i);
            let node = if take_r { r.pop_front() } else { l.pop_front() }
                .ok_or(StructuralError::InvalidChildList)?;
            if take_r {
                for j in 0..node.arity {
                    indices.insert(s + j + 1);
                }
            }
            s += node.arity;
            result.push(node);
        }
        Ok(Key::from_nodes(result))
    }
}

/// Substitute `parts` for successive `{}` holes in `template`.
fn fill(template: &str, parts: &[String]) -> String {
    let mut out = String::new();
    let mut rest = template;
    let mut parts_it = parts.iter();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        if let Some(p) = parts_it.next() {
            out.push_str(p);
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

impl std::fmt::Display for Key {
    /// Render the grammar string. Levels accumulate the parens of every
    /// branching ancestor, so the template for each level is built by
    /// substituting arity shapes into the previous level's template.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = 0;
        let mut cur = String::from("{}");
        let mut nxt: Vec<String> = Vec::new();
        let mut fmt: Vec<String> = Vec::new();
        let mut lvs: Vec<usize> = Vec::new();
        let mut res: Vec<String> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if s == 0 || lvs.last() == Some(&i) {
                lvs.push(s + 1);
            }
            s += node.arity;
            nxt.push(match node.arity {
                0 => String::new(),
                1 => String::from("{}"),
                d => format!("({})", vec!["{}"; d].join(",")),
            });
            fmt.push(node.label.clone());
            if lvs.contains(&(i + 1)) {
                res.push(fill(&cur, &fmt));
                cur = fill(&cur, &nxt);
                nxt.clear();
                fmt.clear();
            }
        }
        write!(f, "{}", res[1..].join(":"))
    }
}
