//! Form-anchored views over a keyspace.
//!
//! An [`Index`] binds a [`KeyForm`] to a [`KeySpace`]: every labelled node
//! of the form's key is resolved to a tree node once, at construction, and
//! the index then spans the keys obtained by growing each open leaf to its
//! height with members of the tree. Enumeration is the cross product of the
//! per-leaf suites, reassembled onto the form key with `link`.
//!
//! Indices subscribe to the tree nodes they anchor through, so the space
//! can consult them before a detach: an index vetoes the removal of any
//! node its anchors pass through, and sheds affected entries from its
//! registered dicts when a merely spanned node goes away.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::StructuralError;
use crate::key::Key;
use crate::keyform::KeyForm;
use crate::keyspace::{KeySpace, NodeId};
use crate::numdict::DictInner;

pub(crate) struct IndexInner {
    pub(crate) space: KeySpace,
    pub(crate) form: KeyForm,
    /// Positions of arity-0 nodes in the form key, level order.
    leaves: Vec<usize>,
    /// Resolved tree node per form key node.
    anchors: Vec<NodeId>,
    /// Height per open leaf.
    heights: Vec<usize>,
    observers: Vec<Weak<RefCell<DictInner>>>,
}

impl IndexInner {
    /// True iff the node at `path` is load-bearing: some anchor path runs
    /// through it.
    pub(crate) fn requires(&self, path: &Key) -> bool {
        let space = self.space.inner.borrow();
        self.leaves.iter().any(|&i| {
            let leaf_key = space.node_key(self.anchors[i]);
            !path.find_in(&leaf_key, None).is_empty()
        })
    }

    /// True iff the node at `path` lies in the spanned region under some
    /// leaf anchor.
    pub(crate) fn depends_on(&self, path: &Key) -> bool {
        let space = self.space.inner.borrow();
        self.leaves.iter().zip(&self.heights).any(|(&i, &h)| {
            let leaf_key = space.node_key(self.anchors[i]);
            !leaf_key.find_in(path, None).is_empty() && path.size() <= leaf_key.size() + h
        })
    }

    /// Tell registered dicts to shed entries touched by the detached node.
    pub(crate) fn on_detach(&self, path: &Key) {
        for dict in self.observers.iter().filter_map(Weak::upgrade) {
            dict.borrow_mut().purge_under(path);
        }
    }
}

/// An immutable handle on a form anchored in a keyspace.
#[derive(Clone)]
pub struct Index {
    pub(crate) inner: Rc<RefCell<IndexInner>>,
}

impl Index {
    /// Resolve `form` against `space`. Fails when a labelled form node has
    /// no member of that name in the tree.
    pub fn new(space: &KeySpace, form: KeyForm) -> Result<Index, StructuralError> {
        let key = form.key().clone();
        let mut anchors: Vec<NodeId> = Vec::with_capacity(key.len());
        let mut parents: Vec<isize> = Vec::new();
        let mut leaves: Vec<usize> = Vec::new();
        {
            let space_inner = space.inner.borrow();
            for (i, node) in key.nodes().iter().enumerate() {
                if i == 0 {
                    anchors.push(space.root());
                    parents.push(-1);
                    parents.extend(std::iter::repeat(0).take(node.arity));
                } else {
                    let p = anchors[parents[i] as usize];
                    let id = *space_inner.nodes[p]
                        .members
                        .get(&node.label)
                        .ok_or_else(|| StructuralError::UnknownMember(node.label.clone()))?;
                    anchors.push(id);
                    parents.extend(std::iter::repeat(i as isize).take(node.arity));
                }
                if node.arity == 0 {
                    leaves.push(i);
                }
            }
        }
        let heights = form.heights().to_vec();
        let inner = Rc::new(RefCell::new(IndexInner {
            space: space.clone(),
            form,
            leaves,
            anchors,
            heights,
            observers: Vec::new(),
        }));
        {
            let anchors = inner.borrow().anchors.clone();
            for id in anchors {
                space.subscribe(id, Rc::downgrade(&inner));
            }
        }
        Ok(Index { inner })
    }

    pub fn space(&self) -> KeySpace {
        self.inner.borrow().space.clone()
    }

    pub fn form(&self) -> KeyForm {
        self.inner.borrow().form.clone()
    }

    /// Membership: the key fits the form exactly and every branch resolves
    /// in the tree.
    pub fn contains(&self, key: &Key) -> bool {
        let inner = self.inner.borrow();
        inner.form.contains(key) && inner.space.contains_key(key)
    }

    /// Number of spanned keys, without enumerating them.
    pub fn len(&self) -> usize {
        let inner = self.inner.borrow();
        let space = inner.space.inner.borrow();
        inner
            .leaves
            .iter()
            .zip(&inner.heights)
            .map(|(&i, &h)| space.count_at(inner.anchors[i], h))
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily enumerate the spanned keys. The suites are snapshotted at
    /// call time; the iterator is unaffected by later tree mutations.
    pub fn iter(&self) -> Keys {
        let inner = self.inner.borrow();
        let space = inner.space.inner.borrow();
        let suites: Vec<Vec<Key>> = inner
            .leaves
            .iter()
            .zip(&inner.heights)
            .map(|(&i, &h)| space.keys_at(inner.anchors[i], h))
            .collect();
        Keys {
            base: inner.form.key().clone(),
            leaves: inner.leaves.clone(),
            cursor: vec![0; suites.len()],
            suites,
            done: false,
        }
    }

    pub(crate) fn register_dict(&self, dict: Weak<RefCell<DictInner>>) {
        let mut inner = self.inner.borrow_mut();
        inner.observers.retain(|w| w.upgrade().is_some());
        inner.observers.push(dict);
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Index) -> bool {
        let a = self.inner.borrow();
        let b = other.inner.borrow();
        a.space.same_space(&b.space) && a.form == b.form
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Index({})", self.inner.borrow().form)
    }
}

/// Odometer over the per-leaf suites; the last leaf varies fastest.
pub struct Keys {
    base: Key,
    leaves: Vec<usize>,
    suites: Vec<Vec<Key>>,
    cursor: Vec<usize>,
    done: bool,
}

impl Iterator for Keys {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.done || self.suites.iter().any(|s| s.is_empty()) {
            self.done = true;
            return None;
        }
        let mut result = self.base.clone();
        // Link in reverse leaf order so earlier form positions stay valid.
        for j in (0..self.leaves.len()).rev() {
            let s = &self.suites[j][self.cursor[j]];
            if s.size() > 0 {
                result = match result.link(s, self.leaves[j], &[]) {
                    Ok(k) => k,
                    Err(_) => {
                        self.done = true;
                        return None;
                    }
                };
            }
        }
        for j in (0..self.cursor.len()).rev() {
            self.cursor[j] += 1;
            if self.cursor[j] < self.suites[j].len() {
                return Some(result);
            }
            self.cursor[j] = 0;
        }
        self.done = true;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn form(s: &str) -> KeyForm {
        KeyForm::from_key(&key(s)).unwrap()
    }

    fn sorted_strings(index: &Index) -> Vec<String> {
        index.iter().map(|k| k.to_string()).collect()
    }

    fn fixture() -> KeySpace {
        let ks = KeySpace::new();
        ks.ensure(&key("a:b")).unwrap();
        ks.ensure(&key("a:c")).unwrap();
        ks.ensure(&key("x:y")).unwrap();
        ks
    }

    #[test]
    fn resolves_anchors_or_fails() {
        let ks = fixture();
        assert!(Index::new(&ks, form("a:?")).is_ok());
        assert!(matches!(
            Index::new(&ks, form("q:?")),
            Err(StructuralError::UnknownMember(_))
        ));
    }

    #[test]
    fn enumerates_single_leaf() {
        let ks = fixture();
        let idx = Index::new(&ks, form("a:?")).unwrap();
        assert_eq!(sorted_strings(&idx), vec!["a:b", "a:c"]);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn enumerates_product_forms() {
        let ks = fixture();
        let idx = Index::new(&ks, form("(a:?,x:?)")).unwrap();
        assert_eq!(sorted_strings(&idx), vec!["(a,x):(b,y)", "(a,x):(c,y)"]);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn zero_height_form_spans_its_own_key() {
        let ks = fixture();
        let idx = Index::new(&ks, form("a:b")).unwrap();
        assert_eq!(sorted_strings(&idx), vec!["a:b"]);
        assert_eq!(idx.len(), 1);
        assert!(idx.contains(&key("a:b")));
        assert!(!idx.contains(&key("a:c")));
    }

    #[test]
    fn agg_index_spans_root() {
        let ks = fixture();
        let idx = Index::new(&ks, KeyForm::agg()).unwrap();
        assert_eq!(idx.iter().collect::<Vec<_>>(), vec![Key::root()]);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn contains_tracks_tree_and_form() {
        let ks = fixture();
        let idx = Index::new(&ks, form("a:?")).unwrap();
        assert!(idx.contains(&key("a:b")));
        assert!(!idx.contains(&key("a")));
        assert!(!idx.contains(&key("a:b:c")));
        assert!(!idx.contains(&key("x:y")));
        assert!(!idx.contains(&key("a:d")));
    }

    #[test]
    fn detach_of_anchor_is_vetoed() {
        let ks = fixture();
        let _idx = Index::new(&ks, form("a:?")).unwrap();
        assert!(matches!(
            ks.detach(ks.root(), "a"),
            Err(StructuralError::Required(_))
        ));
        // Spanned members are not load-bearing.
        let a = ks.resolve(&key("a")).unwrap();
        assert!(ks.detach(a, "b").is_ok());
    }

    #[test]
    fn dropped_index_releases_its_veto() {
        let ks = fixture();
        {
            let _idx = Index::new(&ks, form("a:?")).unwrap();
        }
        assert!(ks.detach(ks.root(), "a").is_ok());
    }

    #[test]
    fn iteration_snapshot_survives_mutation() {
        let ks = fixture();
        let idx = Index::new(&ks, form("a:?")).unwrap();
        let it = idx.iter();
        let a = ks.resolve(&key("a")).unwrap();
        ks.attach(a, "d").unwrap();
        assert_eq!(it.count(), 2);
        assert_eq!(idx.iter().count(), 3);
    }
}
