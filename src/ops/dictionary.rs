//! Structural operations: filtering, rekeying, defaults, broadcasting.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::NumError;
use crate::index::Index;
use crate::key::Key;
use crate::numdict::NumDict;
use crate::tape::TapeSlot;

use super::arithmetic::project;
use super::{GradRule, OpArgs, OpDef};

impl NumDict {
    /// Indicator of the explicit entries: ones there, zero elsewhere.
    pub fn mask(&self, t: &TapeSlot) -> NumDict {
        let map: BTreeMap<Key, f64> = self
            .entries()
            .into_iter()
            .map(|(k, _)| (k, 1.0))
            .collect();
        let r = self.with_same_index(map, 0.0);
        t.record("mask", &r, &[self], OpArgs::default());
        r
    }

    /// Constant dict over the same index.
    pub fn const_like(&self, t: &TapeSlot, c: f64) -> NumDict {
        let r = self.with_same_index(BTreeMap::new(), c);
        t.record(
            "const",
            &r,
            &[self],
            OpArgs {
                c: Some(c),
                ..OpArgs::default()
            },
        );
        r
    }

    /// Same entries under a new default.
    pub fn with_default(&self, t: &TapeSlot, c: f64) -> NumDict {
        let map: BTreeMap<Key, f64> = self.entries().into_iter().collect();
        let r = self.with_same_index(map, c);
        t.record(
            "with_default",
            &r,
            &[self],
            OpArgs {
                c: Some(c),
                ..OpArgs::default()
            },
        );
        r
    }

    /// Keep the explicit entries whose key satisfies the predicate.
    pub fn keep<F>(&self, t: &TapeSlot, pred: F) -> NumDict
    where
        F: Fn(&Key) -> bool,
    {
        let map: BTreeMap<Key, f64> = self
            .entries()
            .into_iter()
            .filter(|(k, _)| pred(k))
            .collect();
        let r = self.with_same_index(map, self.default());
        t.record("keep", &r, &[self], OpArgs::default());
        r
    }

    /// Drop the explicit entries whose key satisfies the predicate.
    pub fn drop_keys<F>(&self, t: &TapeSlot, pred: F) -> NumDict
    where
        F: Fn(&Key) -> bool,
    {
        let map: BTreeMap<Key, f64> = self
            .entries()
            .into_iter()
            .filter(|(k, _)| !pred(k))
            .collect();
        let r = self.with_same_index(map, self.default());
        t.record("drop", &r, &[self], OpArgs::default());
        r
    }

    /// Materialize exactly the given keys as explicit entries.
    pub fn with_keys(&self, t: &TapeSlot, keys: &[Key]) -> Result<NumDict, NumError> {
        let mut map = BTreeMap::new();
        for k in keys {
            map.insert(k.clone(), self.get(k)?);
        }
        let r = self.with_same_index(map, self.default());
        t.record("with_keys", &r, &[self], OpArgs::default());
        Ok(r)
    }

    /// Drop explicit entries equal to the default.
    pub fn squeeze(&self, t: &TapeSlot) -> NumDict {
        let c = self.default();
        let map: BTreeMap<Key, f64> = self
            .entries()
            .into_iter()
            .filter(|&(_, v)| v != c)
            .collect();
        let r = self.with_same_index(map, c);
        t.record("squeeze", &r, &[self], OpArgs::default());
        r
    }

    /// Rewrite every explicit key through a one-to-one map. The images must
    /// be distinct members of the same index.
    pub fn transform_keys<F>(&self, t: &TapeSlot, f: F) -> Result<NumDict, NumError>
    where
        F: Fn(&Key) -> Key,
    {
        let entries = self.entries();
        let mut map = BTreeMap::new();
        for (k, v) in &entries {
            let nk = f(k);
            if !self.contains(&nk) {
                return Err(NumError::Membership(nk));
            }
            map.insert(nk, *v);
        }
        if map.len() != entries.len() {
            return Err(NumError::Value(
                "key transform must be one-to-one".to_string(),
            ));
        }
        let r = self.with_same_index(map, self.default());
        t.record("transform_keys", &r, &[self], OpArgs::default());
        Ok(r)
    }

    /// Softmax over the explicit entries at the given temperature.
    pub fn boltzmann(&self, t: &TapeSlot, temp: f64) -> Result<NumDict, NumError> {
        let entries = self.entries();
        if entries.is_empty() {
            return Err(NumError::Value(
                "boltzmann of a numdict with no explicit entries".to_string(),
            ));
        }
        // softmax(x) = softmax(x + c); shifting by the max keeps exp finite.
        let vmax = entries
            .iter()
            .map(|&(_, v)| v)
            .fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = entries
            .iter()
            .map(|&(_, v)| ((v - vmax) / temp).exp())
            .collect();
        let total: f64 = exps.iter().sum();
        let map: BTreeMap<Key, f64> = entries
            .into_iter()
            .zip(exps)
            .map(|((k, _), e)| (k, e / total))
            .collect();
        let r = self.with_same_index(map, f64::NAN);
        t.record(
            "boltzmann",
            &r,
            &[self],
            OpArgs {
                val: Some(temp),
                ..OpArgs::default()
            },
        );
        Ok(r)
    }

    /// Draw one explicit key with probability proportional to its value and
    /// return the 0/1 indicator.
    pub fn sample<R: Rng>(&self, t: &TapeSlot, rng: &mut R) -> Result<NumDict, NumError> {
        let entries = self.entries();
        if entries.is_empty() {
            return Err(NumError::Value(
                "sample from a numdict with no explicit entries".to_string(),
            ));
        }
        let dist = WeightedIndex::new(entries.iter().map(|&(_, v)| v))
            .map_err(|e| NumError::Arithmetic(format!("bad sampling weights: {}", e)))?;
        let chosen = dist.sample(rng);
        let map: BTreeMap<Key, f64> = entries
            .into_iter()
            .enumerate()
            .map(|(i, (k, _))| (k, if i == chosen { 1.0 } else { 0.0 }))
            .collect();
        let r = self.with_same_index(map, f64::NAN);
        t.record("sample", &r, &[self], OpArgs::default());
        Ok(r)
    }

    /// Broadcast onto a finer index: every key of `index` takes the value
    /// at its projection onto this dict's form.
    pub fn expand(&self, t: &TapeSlot, index: &Index) -> Result<NumDict, NumError> {
        let reduce = self.form().reductor(&index.form())?;
        let c = self.default();
        let mut map = BTreeMap::new();
        for k in index.iter() {
            let v = self.get(&reduce.apply(&k)?)?;
            if v != c {
                map.insert(k, v);
            }
        }
        let r = NumDict::from_parts(index.clone(), map, c);
        t.record("expand", &r, &[self], OpArgs::default());
        Ok(r)
    }
}

fn grad_with_default(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    // Gradient flows through the input's explicit entries; the default
    // path is cut.
    Ok(vec![d[0].mask(t).mul_with(t, &[g], &[])?])
}

fn grad_sample(
    t: &TapeSlot,
    g: &NumDict,
    r: &NumDict,
    _d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![g.mul_with(t, &[r], &[])?])
}

fn grad_expand(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![project(t, g, &d[0].form())?])
}

pub(crate) fn defs() -> Vec<OpDef> {
    vec![
        OpDef::new("mask", GradRule::Zero),
        OpDef::new("const", GradRule::Zero),
        OpDef::new("with_default", GradRule::Fn(grad_with_default)),
        OpDef::new("keep", GradRule::Unimplemented),
        OpDef::new("drop", GradRule::Unimplemented),
        OpDef::new("with_keys", GradRule::Unimplemented),
        OpDef::new("squeeze", GradRule::Unimplemented),
        OpDef::new("transform_keys", GradRule::Unimplemented),
        OpDef::new("boltzmann", GradRule::Unimplemented),
        OpDef::new("sample", GradRule::Fn(grad_sample)),
        OpDef::new("expand", GradRule::Fn(grad_expand)),
    ]
}
