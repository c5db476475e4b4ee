//! Differentiable operations over numeric dicts.
//!
//! Every operation has a registry name, a forward implementation (a method
//! on [`NumDict`], mirrored by a free function in [`funcs`]), and a
//! gradient rule. Forward calls take a [`TapeSlot`] and record themselves
//! when a tape is active; the backward pass looks the rule up by name.
//!
//! Rules come in three kinds: a real gradient function, an explicit zero
//! (discrete-valued ops, skipped during backward), and an explicit
//! placeholder that makes the backward pass fail loudly instead of
//! returning a wrong gradient.

pub mod arithmetic;
pub mod dictionary;
pub mod funcs;
pub mod logical;
pub mod stochastic;

use std::collections::{BTreeMap, HashMap};

use crate::error::{NumError, TapeError};
use crate::index::Index;
use crate::key::Key;
use crate::keyform::KeyForm;
use crate::numdict::{Mode, NumDict};
use crate::tape::TapeSlot;

/// Scalar and form arguments captured alongside a recorded operation,
/// enough to replay its gradient.
#[derive(Clone, Debug, Default)]
pub struct OpArgs {
    pub val: Option<f64>,
    pub lo: Option<f64>,
    pub hi: Option<f64>,
    pub c: Option<f64>,
    /// One branch form per non-receiver operand (or per reduction).
    pub by: Vec<Option<KeyForm>>,
}

impl OpArgs {
    pub(crate) fn with_val(val: f64) -> OpArgs {
        OpArgs {
            val: Some(val),
            ..OpArgs::default()
        }
    }

    pub(crate) fn with_bounds(lo: f64, hi: f64) -> OpArgs {
        OpArgs {
            lo: Some(lo),
            hi: Some(hi),
            ..OpArgs::default()
        }
    }

    pub(crate) fn with_by(by: Vec<Option<KeyForm>>) -> OpArgs {
        OpArgs {
            by,
            ..OpArgs::default()
        }
    }
}

/// Gradient function: maps the incoming gradient, the recorded result, and
/// the recorded operands to one gradient per operand.
pub type GradFn =
    fn(&TapeSlot, &NumDict, &NumDict, &[NumDict], &OpArgs) -> Result<Vec<NumDict>, NumError>;

pub enum GradRule {
    Fn(GradFn),
    /// Discrete-valued: contributes nothing and is skipped.
    Zero,
    /// Declared but not derived; backward fails on it.
    Unimplemented,
}

pub struct OpDef {
    pub name: &'static str,
    pub grad: GradRule,
}

impl OpDef {
    pub fn new(name: &'static str, grad: GradRule) -> OpDef {
        OpDef { name, grad }
    }
}

/// Name-indexed gradient rules consulted by the backward pass.
pub struct OpRegistry {
    ops: HashMap<&'static str, OpDef>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry {
            ops: HashMap::new(),
        }
    }

    /// Add a custom operation; the name must be free.
    pub fn register(&mut self, def: OpDef) -> Result<(), TapeError> {
        if self.ops.contains_key(def.name) {
            return Err(TapeError::DuplicateOp(def.name.to_string()));
        }
        self.ops.insert(def.name, def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OpDef> {
        self.ops.get(name)
    }

    /// Registry with all built-in operations.
    pub fn standard() -> OpRegistry {
        let mut reg = OpRegistry::new();
        for def in arithmetic::defs()
            .into_iter()
            .chain(logical::defs())
            .chain(dictionary::defs())
            .chain(stochastic::defs())
        {
            debug_assert!(!reg.ops.contains_key(def.name), "op {} defined twice", def.name);
            reg.ops.insert(def.name, def);
        }
        reg
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        OpRegistry::standard()
    }
}

/// Lift a pointwise kernel: entries map through it, the default maps too,
/// and entries landing on the new default are dropped.
pub(crate) fn unary_op<F>(
    slot: &TapeSlot,
    d: &NumDict,
    name: &'static str,
    args: OpArgs,
    kernel: F,
) -> NumDict
where
    F: Fn(f64) -> f64,
{
    let c = kernel(d.default());
    let map: BTreeMap<Key, f64> = d
        .entries()
        .into_iter()
        .filter_map(|(k, v)| {
            let nv = kernel(v);
            if nv != c {
                Some((k, nv))
            } else {
                None
            }
        })
        .collect();
    let r = d.with_same_index(map, c);
    slot.record(name, &r, &[d], args);
    r
}

/// Lift a two-place kernel over aligned operands. A NaN default on the
/// receiver restricts the walk to its explicit entries.
pub(crate) fn binary_op<F>(
    slot: &TapeSlot,
    d1: &NumDict,
    d2: &NumDict,
    name: &'static str,
    by: Option<&KeyForm>,
    kernel: F,
) -> Result<NumDict, NumError>
where
    F: Fn(f64, f64) -> f64,
{
    let mode = if d1.default().is_nan() {
        Mode::Own
    } else {
        Mode::Match
    };
    let branches = vec![by.cloned()];
    let rows = d1.collect(&[d2], mode, &branches)?;
    let c = kernel(d1.default(), d2.default());
    let map: BTreeMap<Key, f64> = rows
        .into_iter()
        .filter_map(|(k, vs)| {
            let v = kernel(vs[0], vs[1]);
            if v != c {
                Some((k, v))
            } else {
                None
            }
        })
        .collect();
    let r = d1.with_same_index(map, c);
    slot.record(name, &r, &[d1, d2], OpArgs::with_by(branches));
    Ok(r)
}

/// Reduce a dict onto a coarser form (or all the way to the aggregate
/// form) with a many-to-one kernel. When the default equals the kernel's
/// identity, or is NaN, only the explicit entries feed the groups.
///
/// The grouping form must be strictly coarser than the dict's own form.
/// Grouping by the dict's own form is rejected rather than treated as an
/// identity pass, since singleton groups make the statistical kernels
/// degenerate.
pub(crate) fn reduce_op<F>(
    slot: &TapeSlot,
    d: &NumDict,
    name: &'static str,
    by: Option<&KeyForm>,
    eye: f64,
    kernel: F,
) -> Result<NumDict, NumError>
where
    F: Fn(&[f64]) -> f64,
{
    let own = d.default() == eye || d.default().is_nan();
    let mode = if own { Mode::Own } else { Mode::Full };
    let space = d.index().space();
    match by {
        None => {
            let agg = KeyForm::agg();
            let i = Index::new(&space, agg.clone())?;
            let groups = d.group(&agg, mode)?;
            let c = match groups.get(&Key::root()) {
                Some(vs) => kernel(vs),
                None => kernel(&[d.default()]),
            };
            let r = NumDict::from_parts(i, BTreeMap::new(), c);
            slot.record(name, &r, &[d], OpArgs::default());
            Ok(r)
        }
        Some(by) => {
            if !by.lt(&d.form()) {
                return Err(NumError::Value(format!(
                    "keyform '{}' cannot reduce '{}'",
                    by,
                    d.form()
                )));
            }
            let i = Index::new(&space, by.clone())?;
            let groups = d.group(by, mode)?;
            let c = if own { d.default() } else { f64::NAN };
            let map: BTreeMap<Key, f64> = groups
                .into_iter()
                .filter_map(|(k, vs)| {
                    let v = kernel(&vs);
                    if v != c {
                        Some((k, v))
                    } else {
                        None
                    }
                })
                .collect();
            let r = NumDict::from_parts(i, map, c);
            slot.record(name, &r, &[d], OpArgs::with_by(vec![Some(by.clone())]));
            Ok(r)
        }
    }
}

/// Combine a dict with aligned operands pointwise using a many-to-one
/// kernel over each value row.
pub(crate) fn variadic_op<F>(
    slot: &TapeSlot,
    d: &NumDict,
    others: &[&NumDict],
    name: &'static str,
    by: &[Option<KeyForm>],
    kernel: F,
) -> Result<NumDict, NumError>
where
    F: Fn(&[f64]) -> f64,
{
    let mode = if d.default().is_nan() {
        Mode::Own
    } else {
        Mode::Match
    };
    let rows = d.collect(others, mode, by)?;
    let defaults: Vec<f64> = std::iter::once(d.default())
        .chain(others.iter().map(|o| o.default()))
        .collect();
    let c = kernel(&defaults);
    let map: BTreeMap<Key, f64> = rows
        .into_iter()
        .filter_map(|(k, vs)| {
            let v = kernel(&vs);
            if v != c {
                Some((k, v))
            } else {
                None
            }
        })
        .collect();
    let r = d.with_same_index(map, c);
    let mut operands: Vec<&NumDict> = Vec::with_capacity(1 + others.len());
    operands.push(d);
    operands.extend_from_slice(others);
    slot.record(name, &r, &operands, OpArgs::with_by(by.to_vec()));
    Ok(r)
}

// Aggregation kernels.

pub(crate) fn kernel_sum(vs: &[f64]) -> f64 {
    vs.iter().sum()
}

pub(crate) fn kernel_prod(vs: &[f64]) -> f64 {
    vs.iter().product()
}

pub(crate) fn kernel_max(vs: &[f64]) -> f64 {
    vs.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub(crate) fn kernel_min(vs: &[f64]) -> f64 {
    vs.iter().copied().fold(f64::INFINITY, f64::min)
}

pub(crate) fn kernel_mean(vs: &[f64]) -> f64 {
    kernel_sum(vs) / vs.len() as f64
}

/// Sample variance; NaN below two observations.
pub(crate) fn kernel_variance(vs: &[f64]) -> f64 {
    if vs.len() < 2 {
        return f64::NAN;
    }
    let m = kernel_mean(vs);
    vs.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (vs.len() - 1) as f64
}

pub(crate) fn kernel_stdev(vs: &[f64]) -> f64 {
    kernel_variance(vs).sqrt()
}

pub(crate) fn kernel_pvariance(vs: &[f64]) -> f64 {
    let m = kernel_mean(vs);
    vs.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / vs.len() as f64
}

pub(crate) fn kernel_pstdev(vs: &[f64]) -> f64 {
    kernel_pvariance(vs).sqrt()
}
