//! Mutable namespace trees.
//!
//! A [`KeySpace`] is an arena of named nodes behind a shared handle. Nodes
//! are created directly attached under a parent and carry an ordered member
//! map, so enumeration is deterministic in attachment order. Indices
//! subscribe to the nodes their anchors pass through; detaching a node asks
//! every subscribed index first and is vetoed outright when the node is
//! load-bearing for one of them.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::StructuralError;
use crate::index::IndexInner;
use crate::key::{Key, KeyNode};

pub type NodeId = usize;

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) members: IndexMap<String, NodeId>,
    pub(crate) observers: Vec<Weak<RefCell<IndexInner>>>,
    pub(crate) alive: bool,
}

pub(crate) struct SpaceInner {
    pub(crate) nodes: Vec<Node>,
}

impl SpaceInner {
    /// Path key of a node, as a descent chain from the root.
    pub(crate) fn node_key(&self, id: NodeId) -> Key {
        let mut names: Vec<String> = Vec::new();
        let mut cur = Some(id);
        while let Some(i) = cur {
            if let Some(p) = self.nodes[i].parent {
                names.push(self.nodes[i].name.clone());
                cur = Some(p);
            } else {
                cur = None;
            }
        }
        if names.is_empty() {
            return Key::root();
        }
        names.reverse();
        let n = names.len();
        let mut nodes = vec![KeyNode::new("", 1)];
        for (i, name) in names.into_iter().enumerate() {
            nodes.push(KeyNode::new(name, if i + 1 < n { 1 } else { 0 }));
        }
        Key::from_nodes(nodes)
    }

    pub(crate) fn resolve(&self, path: &Key) -> Option<NodeId> {
        if path.nodes().iter().any(|n| n.arity > 1) {
            return None;
        }
        let mut cur = 0;
        for node in &path.nodes()[1..] {
            cur = *self.nodes[cur].members.get(&node.label)?;
        }
        Some(cur)
    }

    fn contains_at(&self, mut node: NodeId, key: &Key) -> bool {
        let mut k = key.clone();
        while k.size() > 0 && k.arity(0) <= 1 {
            let (head, rest) = match k.cut(1, &[]) {
                Ok(pair) => pair,
                Err(_) => return false,
            };
            match self.nodes[node].members.get(head.label(1)) {
                Some(&child) => node = child,
                None => return false,
            }
            k = rest;
        }
        while k.size() > 0 {
            let (rest, branch) = match k.cut(0, &[0]) {
                Ok(pair) => pair,
                Err(_) => return false,
            };
            if !self.contains_at(node, &branch) {
                return false;
            }
            k = rest;
        }
        true
    }

    /// All keys of depth `h` rooted at `node`, in member order. Depth zero
    /// is the root key alone; a childless node spans nothing deeper.
    pub(crate) fn keys_at(&self, node: NodeId, h: usize) -> Vec<Key> {
        if h == 0 {
            return vec![Key::root()];
        }
        let mut out = Vec::new();
        for (name, &child) in &self.nodes[node].members {
            let stem = Key::from_nodes(vec![KeyNode::new("", 1), KeyNode::new(name.clone(), 0)]);
            if h == 1 {
                out.push(stem);
            } else {
                for suite in self.keys_at(child, h - 1) {
                    if let Ok(k) = stem.link(&suite, 1, &[]) {
                        out.push(k);
                    }
                }
            }
        }
        out
    }

    /// Number of keys of depth `h` rooted at `node`.
    pub(crate) fn count_at(&self, node: NodeId, h: usize) -> usize {
        if h == 0 {
            return 1;
        }
        self.nodes[node]
            .members
            .values()
            .map(|&child| self.count_at(child, h - 1))
            .sum()
    }

    fn tombstone(&mut self, id: NodeId) {
        self.nodes[id].alive = false;
        let members: Vec<NodeId> = self.nodes[id].members.values().copied().collect();
        self.nodes[id].members.clear();
        for child in members {
            self.tombstone(child);
        }
    }
}

/// Shared handle to a namespace tree.
#[derive(Clone)]
pub struct KeySpace {
    pub(crate) inner: Rc<RefCell<SpaceInner>>,
}

impl KeySpace {
    pub fn new() -> KeySpace {
        KeySpace {
            inner: Rc::new(RefCell::new(SpaceInner {
                nodes: vec![Node {
                    name: String::new(),
                    parent: None,
                    members: IndexMap::new(),
                    observers: Vec::new(),
                    alive: true,
                }],
            })),
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    /// Two handles name the same tree.
    pub fn same_space(&self, other: &KeySpace) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a child named `name` under `parent`. Names are dotted runs of
    /// identifiers; a taken name is an error.
    pub fn attach(&self, parent: NodeId, name: &str) -> Result<NodeId, StructuralError> {
        if !valid_name(name) {
            return Err(StructuralError::InvalidName(name.to_string()));
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.nodes[parent].alive {
            return Err(StructuralError::UnknownMember(name.to_string()));
        }
        if inner.nodes[parent].members.contains_key(name) {
            return Err(StructuralError::DuplicateName(name.to_string()));
        }
        let id = inner.nodes.len();
        inner.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            members: IndexMap::new(),
            observers: Vec::new(),
            alive: true,
        });
        inner.nodes[parent].members.insert(name.to_string(), id);
        Ok(id)
    }

    /// Walk `path` from the root, attaching any missing segment along the
    /// way, and return the final node.
    pub fn ensure(&self, path: &Key) -> Result<NodeId, StructuralError> {
        if path.nodes().iter().any(|n| n.arity > 1) {
            return Err(StructuralError::NotAPath(path.to_string()));
        }
        let mut cur = 0;
        for node in &path.nodes()[1..] {
            let existing = self.inner.borrow().nodes[cur].members.get(&node.label).copied();
            cur = match existing {
                Some(id) => id,
                None => self.attach(cur, &node.label)?,
            };
        }
        Ok(cur)
    }

    /// Remove the member `name` of `parent` together with its whole
    /// subtree. Every index subscribed at `parent` is consulted first: if
    /// any requires the doomed node, nothing is removed. Indices that
    /// merely span it are told to shed the affected entries.
    pub fn detach(&self, parent: NodeId, name: &str) -> Result<(), StructuralError> {
        let (child, child_key, watchers) = {
            let inner = self.inner.borrow();
            let child = *inner.nodes[parent]
                .members
                .get(name)
                .ok_or_else(|| StructuralError::UnknownMember(name.to_string()))?;
            let child_key = inner.node_key(child);
            (child, child_key, inner.nodes[parent].observers.clone())
        };
        let live: Vec<Rc<RefCell<IndexInner>>> =
            watchers.iter().filter_map(Weak::upgrade).collect();
        for idx in &live {
            if idx.borrow().requires(&child_key) {
                return Err(StructuralError::Required(child_key.to_string()));
            }
        }
        for idx in &live {
            let inner = idx.borrow();
            if inner.depends_on(&child_key) {
                inner.on_detach(&child_key);
            }
        }
        let mut inner = self.inner.borrow_mut();
        inner.nodes[parent].members.shift_remove(name);
        inner.tombstone(child);
        Ok(())
    }

    pub fn node_key(&self, id: NodeId) -> Key {
        self.inner.borrow().node_key(id)
    }

    pub fn resolve(&self, path: &Key) -> Option<NodeId> {
        self.inner.borrow().resolve(path)
    }

    /// Full membership test against the tree: descent chains resolve level
    /// by level, product keys split at the root and every branch must hold.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.inner.borrow().contains_at(0, key)
    }

    pub fn keys_at(&self, node: NodeId, h: usize) -> Vec<Key> {
        self.inner.borrow().keys_at(node, h)
    }

    pub(crate) fn subscribe(&self, node: NodeId, obs: Weak<RefCell<IndexInner>>) {
        let mut inner = self.inner.borrow_mut();
        inner.nodes[node].observers.retain(|w| w.upgrade().is_some());
        inner.nodes[node].observers.push(obs);
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        KeySpace::new()
    }
}

/// Dotted runs of ASCII identifiers.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    #[test]
    fn attach_and_resolve() {
        let ks = KeySpace::new();
        let a = ks.attach(ks.root(), "a").unwrap();
        let b = ks.attach(a, "b").unwrap();
        assert_eq!(ks.resolve(&key("a")), Some(a));
        assert_eq!(ks.resolve(&key("a:b")), Some(b));
        assert_eq!(ks.resolve(&key("a:c")), None);
        assert_eq!(ks.node_key(b), key("a:b"));
        assert_eq!(ks.node_key(ks.root()), Key::root());
    }

    #[test]
    fn names_are_validated() {
        let ks = KeySpace::new();
        assert!(matches!(
            ks.attach(ks.root(), ""),
            Err(StructuralError::InvalidName(_))
        ));
        assert!(matches!(
            ks.attach(ks.root(), "1a"),
            Err(StructuralError::InvalidName(_))
        ));
        assert!(matches!(
            ks.attach(ks.root(), "a b"),
            Err(StructuralError::InvalidName(_))
        ));
        assert!(ks.attach(ks.root(), "io.input_1").is_ok());
        ks.attach(ks.root(), "a").unwrap();
        assert!(matches!(
            ks.attach(ks.root(), "a"),
            Err(StructuralError::DuplicateName(_))
        ));
    }

    #[test]
    fn ensure_walks_and_creates() {
        let ks = KeySpace::new();
        let c = ks.ensure(&key("a:b:c")).unwrap();
        assert_eq!(ks.resolve(&key("a:b:c")), Some(c));
        // Idempotent.
        assert_eq!(ks.ensure(&key("a:b:c")).unwrap(), c);
        assert!(matches!(
            ks.ensure(&key("(a,b)")),
            Err(StructuralError::NotAPath(_))
        ));
    }

    #[test]
    fn contains_product_keys() {
        let ks = KeySpace::new();
        let a = ks.ensure(&key("a")).unwrap();
        ks.attach(a, "b").unwrap();
        ks.attach(a, "c").unwrap();
        assert!(ks.contains_key(&key("a:b")));
        assert!(ks.contains_key(&key("a:(b,c)")));
        assert!(!ks.contains_key(&key("a:(b,d)")));
        assert!(ks.contains_key(&Key::root()));
        assert!(!ks.contains_key(&key("b")));
    }

    #[test]
    fn keys_at_enumerates_depthwise() {
        let ks = KeySpace::new();
        let a = ks.ensure(&key("a")).unwrap();
        ks.attach(a, "b").unwrap();
        ks.attach(a, "c").unwrap();
        let level1: Vec<String> = ks
            .keys_at(ks.root(), 1)
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(level1, vec!["a"]);
        let level2: Vec<String> = ks
            .keys_at(ks.root(), 2)
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(level2, vec!["a:b", "a:c"]);
        assert_eq!(ks.keys_at(ks.root(), 0), vec![Key::root()]);
        assert!(ks.keys_at(ks.root(), 3).is_empty());
    }

    #[test]
    fn detach_removes_subtree() {
        let ks = KeySpace::new();
        ks.ensure(&key("a:b:c")).unwrap();
        ks.detach(ks.root(), "a").unwrap();
        assert_eq!(ks.resolve(&key("a")), None);
        assert!(!ks.contains_key(&key("a:b")));
        assert!(matches!(
            ks.detach(ks.root(), "a"),
            Err(StructuralError::UnknownMember(_))
        ));
    }
}
