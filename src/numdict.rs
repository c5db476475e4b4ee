//! Sparse numeric mappings over an index.
//!
//! A [`NumDict`] pairs an [`Index`] with a `BTreeMap` of explicit entries
//! and a default value covering the rest of the index's extent. Handles are
//! cheap clones of one shared cell; operation results always come out
//! canonical (no explicit entry equals the default), while `set` stores
//! whatever it is given.
//!
//! Data is protected by default. Mutation goes through a scoped guard from
//! [`NumDict::mutable`], and the guard is refused while the dict sits on an
//! active gradient tape.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::error::NumError;
use crate::index::Index;
use crate::key::Key;
use crate::keyform::{KeyForm, Reductor};

pub(crate) struct DictInner {
    pub(crate) index: Index,
    pub(crate) map: BTreeMap<Key, f64>,
    pub(crate) default: f64,
    pub(crate) protected: bool,
    /// Number of active tapes holding this dict.
    pub(crate) recorded: u32,
}

impl DictInner {
    /// Drop every explicit entry the detached node reaches into.
    pub(crate) fn purge_under(&mut self, path: &Key) {
        self.map.retain(|k, _| path.find_in(k, None).is_empty());
    }
}

/// Which keys an operation walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Explicit entries of the receiver only.
    Own,
    /// Union of explicit entries across operands, within the receiver's
    /// extent; falls back to the full extent when operand forms differ.
    Match,
    /// The receiver's full extent.
    Full,
}

#[derive(Clone)]
pub struct NumDict {
    pub(crate) inner: Rc<RefCell<DictInner>>,
}

impl NumDict {
    /// Build a dict, checking every explicit key against the index.
    pub fn new(index: Index, data: BTreeMap<Key, f64>, default: f64) -> Result<NumDict, NumError> {
        for key in data.keys() {
            if !index.contains(key) {
                return Err(NumError::Membership(key.clone()));
            }
        }
        Ok(NumDict::from_parts(index, data, default))
    }

    /// Operation-result constructor: entries are trusted.
    pub(crate) fn from_parts(index: Index, map: BTreeMap<Key, f64>, default: f64) -> NumDict {
        let inner = Rc::new(RefCell::new(DictInner {
            index: index.clone(),
            map,
            default,
            protected: true,
            recorded: 0,
        }));
        index.register_dict(Rc::downgrade(&inner));
        NumDict { inner }
    }

    pub fn index(&self) -> Index {
        self.inner.borrow().index.clone()
    }

    pub fn form(&self) -> KeyForm {
        self.inner.borrow().index.form()
    }

    pub fn default(&self) -> f64 {
        self.inner.borrow().default
    }

    /// Explicit entries, in key order.
    pub fn entries(&self) -> Vec<(Key, f64)> {
        self.inner
            .borrow()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn num_entries(&self) -> usize {
        self.inner.borrow().map.len()
    }

    /// Size of the full extent.
    pub fn len(&self) -> usize {
        self.inner.borrow().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.borrow().index.contains(key)
    }

    /// Every key of the extent, in index order.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.borrow().index.iter().collect()
    }

    pub fn get(&self, key: &Key) -> Result<f64, NumError> {
        let inner = self.inner.borrow();
        if let Some(&v) = inner.map.get(key) {
            return Ok(v);
        }
        if inner.index.contains(key) {
            Ok(inner.default)
        } else {
            Err(NumError::Membership(key.clone()))
        }
    }

    /// Entry value or default, without a membership check.
    pub(crate) fn peek(&self, key: &Key) -> f64 {
        let inner = self.inner.borrow();
        inner.map.get(key).copied().unwrap_or(inner.default)
    }

    /// Fresh dict with the same index and contents but its own identity.
    pub fn copy(&self) -> NumDict {
        let inner = self.inner.borrow();
        NumDict::from_parts(inner.index.clone(), inner.map.clone(), inner.default)
    }

    pub(crate) fn with_same_index(&self, map: BTreeMap<Key, f64>, default: f64) -> NumDict {
        NumDict::from_parts(self.index(), map, default)
    }

    /// Pointer identity, stable while any handle or tape cell lives.
    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    /// Open a mutation scope. Refused while the dict is held by an active
    /// tape, and scopes do not stack.
    pub fn mutable(&self) -> Result<MutGuard<'_>, NumError> {
        let mut inner = self.inner.borrow_mut();
        if inner.recorded > 0 || !inner.protected {
            return Err(NumError::Protected);
        }
        inner.protected = false;
        drop(inner);
        Ok(MutGuard { dict: self })
    }

    pub fn valmax(&self) -> Result<f64, NumError> {
        let mut best = f64::NEG_INFINITY;
        let mut found = false;
        for k in self.index().iter() {
            let v = self.peek(&k);
            if !found || v > best {
                best = v;
                found = true;
            }
        }
        if found {
            Ok(best)
        } else {
            Err(NumError::Value("valmax of an empty numdict".to_string()))
        }
    }

    pub fn valmin(&self) -> Result<f64, NumError> {
        let mut best = f64::INFINITY;
        let mut found = false;
        for k in self.index().iter() {
            let v = self.peek(&k);
            if !found || v < best {
                best = v;
                found = true;
            }
        }
        if found {
            Ok(best)
        } else {
            Err(NumError::Value("valmin of an empty numdict".to_string()))
        }
    }

    pub fn argmax(&self) -> Result<Key, NumError> {
        let mut best: Option<(Key, f64)> = None;
        for k in self.scan_keys() {
            let v = self.peek(&k);
            match &best {
                Some((_, bv)) if *bv >= v => {}
                _ => best = Some((k, v)),
            }
        }
        best.map(|(k, _)| k)
            .ok_or_else(|| NumError::Value("argmax of an empty numdict".to_string()))
    }

    pub fn argmin(&self) -> Result<Key, NumError> {
        let mut best: Option<(Key, f64)> = None;
        for k in self.scan_keys() {
            let v = self.peek(&k);
            match &best {
                Some((_, bv)) if *bv <= v => {}
                _ => best = Some((k, v)),
            }
        }
        best.map(|(k, _)| k)
            .ok_or_else(|| NumError::Value("argmin of an empty numdict".to_string()))
    }

    /// Per-group maximizing key under `by`.
    pub fn argmax_by(
        &self,
        by: &KeyForm,
        branch: Option<usize>,
    ) -> Result<BTreeMap<Key, Key>, NumError> {
        let mut kmax: BTreeMap<Key, Key> = BTreeMap::new();
        let mut vmax: BTreeMap<Key, f64> = BTreeMap::new();
        for k in self.scan_keys() {
            let g = by.reduce(&k, branch)?;
            let v = self.peek(&k);
            match vmax.get(&g) {
                Some(&cur) if cur >= v => {}
                _ => {
                    vmax.insert(g.clone(), v);
                    kmax.insert(g, k);
                }
            }
        }
        Ok(kmax)
    }

    pub fn argmin_by(
        &self,
        by: &KeyForm,
        branch: Option<usize>,
    ) -> Result<BTreeMap<Key, Key>, NumError> {
        let mut kmin: BTreeMap<Key, Key> = BTreeMap::new();
        let mut vmin: BTreeMap<Key, f64> = BTreeMap::new();
        for k in self.scan_keys() {
            let g = by.reduce(&k, branch)?;
            let v = self.peek(&k);
            match vmin.get(&g) {
                Some(&cur) if cur <= v => {}
                _ => {
                    vmin.insert(g.clone(), v);
                    kmin.insert(g, k);
                }
            }
        }
        Ok(kmin)
    }

    /// Explicit keys when the default is NaN, else the full extent.
    fn scan_keys(&self) -> Vec<Key> {
        if self.default().is_nan() {
            self.entries().into_iter().map(|(k, _)| k).collect()
        } else {
            self.keys()
        }
    }

    /// Union of explicit keys across `self` and `others`, restricted to
    /// this dict's extent, in first-seen order.
    pub(crate) fn union_keys(&self, others: &[&NumDict]) -> Vec<Key> {
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        let mut out = Vec::new();
        let own: Vec<Key> = self.entries().into_iter().map(|(k, _)| k).collect();
        let rest = others
            .iter()
            .flat_map(|d| d.entries().into_iter().map(|(k, _)| k));
        for k in own.into_iter().chain(rest) {
            if !seen.contains(&k) && self.contains(&k) {
                out.push(k.clone());
            }
            seen.insert(k);
        }
        out
    }

    /// Align `others` against this dict and walk the keys chosen by `mode`,
    /// yielding the value row per key. Each operand's value is read at the
    /// key's projection onto that operand's form (or the given branch
    /// form).
    pub(crate) fn collect(
        &self,
        others: &[&NumDict],
        mode: Mode,
        branches: &[Option<KeyForm>],
    ) -> Result<Vec<(Key, Vec<f64>)>, NumError> {
        if !branches.is_empty() && branches.len() != others.len() {
            return Err(NumError::Value(
                "one branch form per operand expected".to_string(),
            ));
        }
        let space = self.index().space();
        let mut invariant = true;
        let mut reductors: Vec<Reductor> = Vec::with_capacity(others.len());
        for (i, d) in others.iter().enumerate() {
            if !d.index().space().same_space(&space) {
                return Err(NumError::Structure(
                    crate::error::StructuralError::IncompatibleSpaces,
                ));
            }
            if d.form() != self.form() {
                invariant = false;
            }
            let source = match branches.get(i).and_then(|b| b.as_ref()) {
                Some(b) => b.clone(),
                None => self.form(),
            };
            reductors.push(d.form().reductor(&source)?);
        }
        let keys: Vec<Key> = match mode {
            Mode::Own => self.entries().into_iter().map(|(k, _)| k).collect(),
            Mode::Match if invariant => self.union_keys(others),
            Mode::Match | Mode::Full => self.keys(),
        };
        let mut rows = Vec::with_capacity(keys.len());
        for k in keys {
            let mut data = vec![self.peek(&k)];
            for (d, reduce) in others.iter().zip(&reductors) {
                let g = reduce.apply(&k)?;
                data.push(d.get(&g)?);
            }
            rows.push((k, data));
        }
        Ok(rows)
    }

    /// Group this dict's values by their projection onto `form`.
    pub(crate) fn group(
        &self,
        form: &KeyForm,
        mode: Mode,
    ) -> Result<BTreeMap<Key, Vec<f64>>, NumError> {
        let reduce = form.reductor(&self.form())?;
        let keys: Vec<Key> = match mode {
            Mode::Own => self.entries().into_iter().map(|(k, _)| k).collect(),
            Mode::Match | Mode::Full => self.keys(),
        };
        let mut items: BTreeMap<Key, Vec<f64>> = BTreeMap::new();
        for k in keys {
            let g = reduce.apply(&k)?;
            items.entry(g).or_default().push(self.peek(&k));
        }
        Ok(items)
    }
}

impl std::fmt::Debug for NumDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "NumDict('{}' c={}", inner.index.form(), inner.default)?;
        for (k, v) in &inner.map {
            write!(f, ", {}={}", k, v)?;
        }
        write!(f, ")")
    }
}

/// Scoped write access; protection is restored on drop.
pub struct MutGuard<'a> {
    dict: &'a NumDict,
}

impl MutGuard<'_> {
    pub fn set(&mut self, key: &Key, value: f64) -> Result<(), NumError> {
        let mut inner = self.dict.inner.borrow_mut();
        if !inner.index.contains(key) {
            return Err(NumError::Membership(key.clone()));
        }
        inner.map.insert(key.clone(), value);
        Ok(())
    }

    /// Insert many entries; nothing is written unless all keys belong.
    pub fn update<I>(&mut self, data: I) -> Result<(), NumError>
    where
        I: IntoIterator<Item = (Key, f64)>,
    {
        let data: Vec<(Key, f64)> = data.into_iter().collect();
        let mut inner = self.dict.inner.borrow_mut();
        for (k, _) in &data {
            if !inner.index.contains(k) {
                return Err(NumError::Membership(k.clone()));
            }
        }
        inner.map.extend(data);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.dict.inner.borrow_mut().map.clear();
    }

    pub fn set_default(&mut self, c: f64) {
        self.dict.inner.borrow_mut().default = c;
    }
}

impl Drop for MutGuard<'_> {
    fn drop(&mut self) {
        self.dict.inner.borrow_mut().protected = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::KeySpace;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn form(s: &str) -> KeyForm {
        KeyForm::from_key(&key(s)).unwrap()
    }

    fn fixture() -> (KeySpace, NumDict) {
        let ks = KeySpace::new();
        ks.ensure(&key("a:b")).unwrap();
        ks.ensure(&key("a:c")).unwrap();
        let idx = Index::new(&ks, form("a:?")).unwrap();
        let d = NumDict::new(idx, BTreeMap::new(), 0.0).unwrap();
        (ks, d)
    }

    #[test]
    fn get_falls_back_to_default() {
        let (_ks, d) = fixture();
        assert_eq!(d.get(&key("a:b")).unwrap(), 0.0);
        let mut m = d.mutable().unwrap();
        m.set(&key("a:b"), 2.5).unwrap();
        drop(m);
        assert_eq!(d.get(&key("a:b")).unwrap(), 2.5);
        assert_eq!(d.get(&key("a:c")).unwrap(), 0.0);
        assert!(matches!(
            d.get(&key("a:z")),
            Err(NumError::Membership(_))
        ));
    }

    #[test]
    fn set_rejects_non_members() {
        let (_ks, d) = fixture();
        let mut m = d.mutable().unwrap();
        assert!(matches!(
            m.set(&key("a:z"), 1.0),
            Err(NumError::Membership(_))
        ));
        assert!(matches!(
            m.update(vec![(key("a:b"), 1.0), (key("q"), 2.0)]),
            Err(NumError::Membership(_))
        ));
        // The failed update wrote nothing.
        drop(m);
        assert_eq!(d.num_entries(), 0);
    }

    #[test]
    fn construction_validates_entries() {
        let (ks, d) = fixture();
        let mut bad = BTreeMap::new();
        bad.insert(key("x"), 1.0);
        assert!(matches!(
            NumDict::new(d.index(), bad, 0.0),
            Err(NumError::Membership(_))
        ));
        let _ = ks;
    }

    #[test]
    fn collect_match_walks_entry_union() {
        let (_ks, d) = fixture();
        let e = d.copy();
        d.mutable().unwrap().set(&key("a:b"), 1.0).unwrap();
        e.mutable().unwrap().set(&key("a:c"), 2.0).unwrap();
        let rows = d.collect(&[&e], Mode::Match, &[]).unwrap();
        let got: Vec<(String, Vec<f64>)> = rows
            .into_iter()
            .map(|(k, vs)| (k.to_string(), vs))
            .collect();
        assert_eq!(
            got,
            vec![
                ("a:b".to_string(), vec![1.0, 0.0]),
                ("a:c".to_string(), vec![0.0, 2.0]),
            ]
        );
    }

    #[test]
    fn collect_projects_smaller_operands() {
        let (ks, d) = fixture();
        d.mutable().unwrap().set(&key("a:b"), 3.0).unwrap();
        let agg = NumDict::new(Index::new(&ks, KeyForm::agg()).unwrap(), BTreeMap::new(), 10.0)
            .unwrap();
        let rows = d.collect(&[&agg], Mode::Full, &[]).unwrap();
        assert_eq!(rows.len(), 2);
        for (_, vs) in rows {
            assert_eq!(vs[1], 10.0);
        }
    }

    #[test]
    fn group_by_aggregate_form() {
        let (_ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("a:b"), 1.0).unwrap();
            m.set(&key("a:c"), 2.0).unwrap();
        }
        let groups = d.group(&KeyForm::agg(), Mode::Full).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&Key::root()], vec![1.0, 2.0]);
    }

    #[test]
    fn argmax_and_valmax() {
        let (_ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("a:c"), 5.0).unwrap();
        }
        assert_eq!(d.valmax().unwrap(), 5.0);
        assert_eq!(d.valmin().unwrap(), 0.0);
        assert_eq!(d.argmax().unwrap(), key("a:c"));
        assert_eq!(d.argmin().unwrap(), key("a:b"));
    }

    #[test]
    fn detach_purges_affected_entries() {
        let (ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("a:b"), 1.0).unwrap();
            m.set(&key("a:c"), 2.0).unwrap();
        }
        let a = ks.resolve(&key("a")).unwrap();
        ks.detach(a, "b").unwrap();
        assert_eq!(d.num_entries(), 1);
        assert_eq!(d.entries()[0].0, key("a:c"));
    }
}
