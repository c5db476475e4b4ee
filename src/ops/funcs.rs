//! Free-function spellings of the common operations.
//!
//! Convenience for call sites that combine several dicts and read better
//! in prefix form; everything delegates to the inherent methods.

use crate::error::NumError;
use crate::keyform::KeyForm;
use crate::numdict::NumDict;
use crate::tape::TapeSlot;

/// Pointwise sum of one or more dicts, aligned on the first.
pub fn sum(t: &TapeSlot, d: &NumDict, others: &[&NumDict]) -> Result<NumDict, NumError> {
    if others.is_empty() {
        return Ok(d.clone());
    }
    d.sum_with(t, others, &[])
}

/// Pointwise product of one or more dicts, aligned on the first.
pub fn mul(t: &TapeSlot, d: &NumDict, others: &[&NumDict]) -> Result<NumDict, NumError> {
    if others.is_empty() {
        return Ok(d.clone());
    }
    d.mul_with(t, others, &[])
}

pub fn maximum(t: &TapeSlot, d: &NumDict, others: &[&NumDict]) -> Result<NumDict, NumError> {
    if others.is_empty() {
        return Ok(d.clone());
    }
    d.max_with(t, others, &[])
}

pub fn minimum(t: &TapeSlot, d: &NumDict, others: &[&NumDict]) -> Result<NumDict, NumError> {
    if others.is_empty() {
        return Ok(d.clone());
    }
    d.min_with(t, others, &[])
}

pub fn sub(t: &TapeSlot, d1: &NumDict, d2: &NumDict) -> Result<NumDict, NumError> {
    d1.sub(t, d2, None)
}

pub fn div(t: &TapeSlot, d1: &NumDict, d2: &NumDict) -> Result<NumDict, NumError> {
    d1.div(t, d2, None)
}

/// Total of all values, as an aggregate-form dict.
pub fn total(t: &TapeSlot, d: &NumDict) -> Result<NumDict, NumError> {
    d.sum(t)
}

/// Grouped totals under a coarser form.
pub fn total_by(t: &TapeSlot, d: &NumDict, by: &KeyForm) -> Result<NumDict, NumError> {
    d.sum_by(t, by)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::index::Index;
    use crate::key::Key;
    use crate::keyspace::KeySpace;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    #[test]
    fn prefix_forms_delegate() {
        let ks = KeySpace::new();
        ks.ensure(&key("a:b")).unwrap();
        ks.ensure(&key("a:c")).unwrap();
        let form = KeyForm::from_key(&key("a:?")).unwrap();
        let d = NumDict::new(Index::new(&ks, form).unwrap(), BTreeMap::new(), 1.0).unwrap();
        let e = d.copy();
        let t = TapeSlot::new();
        let s = sum(&t, &d, &[&e]).unwrap();
        assert_eq!(s.get(&key("a:b")).unwrap(), 2.0);
        let p = mul(&t, &d, &[&e, &e]).unwrap();
        assert_eq!(p.get(&key("a:c")).unwrap(), 1.0);
        let q = total(&t, &d).unwrap();
        assert_eq!(q.get(&Key::root()).unwrap(), 2.0);
    }
}
