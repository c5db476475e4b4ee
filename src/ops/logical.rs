//! Predicates and other discrete-valued operations.
//!
//! Results are 0/1 indicators (except `copysign`). All ops here carry a
//! zero gradient rule: they record, but contribute nothing backward.

use crate::error::NumError;
use crate::keyform::KeyForm;
use crate::numdict::NumDict;
use crate::tape::TapeSlot;

use super::{binary_op, unary_op, GradRule, OpArgs, OpDef};

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl NumDict {
    pub fn isfinite(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "isfinite", OpArgs::default(), |x| flag(x.is_finite()))
    }

    pub fn isnan(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "isnan", OpArgs::default(), |x| flag(x.is_nan()))
    }

    pub fn isinf(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "isinf", OpArgs::default(), |x| flag(x.is_infinite()))
    }

    pub fn isbetween(&self, t: &TapeSlot, lo: f64, hi: f64) -> NumDict {
        unary_op(t, self, "isbetween", OpArgs::with_bounds(lo, hi), move |x| {
            flag(lo <= x && x <= hi)
        })
    }

    pub fn eq(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "eq", by, |a, b| flag(a == b))
    }

    pub fn gt(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "gt", by, |a, b| flag(a > b))
    }

    pub fn lt(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "lt", by, |a, b| flag(a < b))
    }

    pub fn ge(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "ge", by, |a, b| flag(a >= b))
    }

    pub fn le(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "le", by, |a, b| flag(a <= b))
    }

    /// Approximate equality with relative and absolute tolerances.
    pub fn isclose(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
        rel_tol: f64,
        abs_tol: f64,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "isclose", by, move |a, b| {
            flag((a - b).abs() <= f64::max(rel_tol * f64::max(a.abs(), b.abs()), abs_tol))
        })
    }

    /// Magnitude of `self` with the sign of `other`.
    pub fn copysign(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "copysign", by, f64::copysign)
    }
}

pub(crate) fn defs() -> Vec<OpDef> {
    vec![
        OpDef::new("isfinite", GradRule::Zero),
        OpDef::new("isnan", GradRule::Zero),
        OpDef::new("isinf", GradRule::Zero),
        OpDef::new("isbetween", GradRule::Zero),
        OpDef::new("eq", GradRule::Zero),
        OpDef::new("gt", GradRule::Zero),
        OpDef::new("lt", GradRule::Zero),
        OpDef::new("ge", GradRule::Zero),
        OpDef::new("le", GradRule::Zero),
        OpDef::new("isclose", GradRule::Zero),
        OpDef::new("copysign", GradRule::Zero),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::index::Index;
    use crate::key::Key;
    use crate::keyform::KeyForm;
    use crate::keyspace::KeySpace;
    use crate::numdict::NumDict;
    use crate::tape::TapeSlot;

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn fixture() -> NumDict {
        let ks = KeySpace::new();
        ks.ensure(&key("a:b")).unwrap();
        ks.ensure(&key("a:c")).unwrap();
        let form = KeyForm::from_key(&key("a:?")).unwrap();
        NumDict::new(Index::new(&ks, form).unwrap(), BTreeMap::new(), 0.0).unwrap()
    }

    #[test]
    fn predicates_yield_indicators() {
        let d = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("a:b"), f64::NAN).unwrap();
            m.set(&key("a:c"), 2.0).unwrap();
        }
        let t = TapeSlot::new();
        let nan = d.isnan(&t);
        assert_eq!(nan.get(&key("a:b")).unwrap(), 1.0);
        assert_eq!(nan.get(&key("a:c")).unwrap(), 0.0);
        let fin = d.isfinite(&t);
        assert_eq!(fin.default(), 1.0);
        assert_eq!(fin.get(&key("a:b")).unwrap(), 0.0);
    }

    #[test]
    fn comparisons_align_pointwise() {
        let d = fixture();
        let e = d.copy();
        d.mutable().unwrap().set(&key("a:b"), 2.0).unwrap();
        e.mutable().unwrap().set(&key("a:b"), 2.0).unwrap();
        e.mutable().unwrap().set(&key("a:c"), 1.0).unwrap();
        let t = TapeSlot::new();
        let q = d.eq(&t, &e, None).unwrap();
        assert_eq!(q.get(&key("a:b")).unwrap(), 1.0);
        assert_eq!(q.get(&key("a:c")).unwrap(), 0.0);
        let l = d.lt(&t, &e, None).unwrap();
        assert_eq!(l.get(&key("a:c")).unwrap(), 1.0);
    }

    #[test]
    fn isbetween_is_inclusive() {
        let d = fixture();
        d.mutable().unwrap().set(&key("a:b"), 1.0).unwrap();
        let t = TapeSlot::new();
        let r = d.isbetween(&t, 0.0, 1.0);
        assert_eq!(r.get(&key("a:b")).unwrap(), 1.0);
        assert_eq!(r.get(&key("a:c")).unwrap(), 1.0);
        let r = d.isbetween(&t, 2.0, 3.0);
        assert_eq!(r.get(&key("a:b")).unwrap(), 0.0);
    }
}
