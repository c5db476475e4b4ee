//! Pointwise arithmetic, reductions, and their gradients.
//!
//! Reductions treat a default equal to the kernel's identity element (or
//! NaN) as absorbing: only explicit entries feed the groups. Otherwise the
//! whole extent is folded, entry by entry.

use crate::error::NumError;
use crate::keyform::KeyForm;
use crate::numdict::NumDict;
use crate::tape::TapeSlot;

use super::{
    binary_op, kernel_max, kernel_mean, kernel_min, kernel_prod, kernel_pstdev,
    kernel_pvariance, kernel_stdev, kernel_sum, kernel_variance, reduce_op, unary_op,
    variadic_op, GradRule, OpArgs, OpDef,
};

impl NumDict {
    pub fn neg(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "neg", OpArgs::default(), |x| -x)
    }

    pub fn abs(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "abs", OpArgs::default(), f64::abs)
    }

    /// Pointwise reciprocal; zero maps to `zero` instead of infinity.
    pub fn inv(&self, t: &TapeSlot, zero: f64) -> NumDict {
        unary_op(t, self, "inv", OpArgs::with_val(zero), move |x| {
            if x != 0.0 {
                1.0 / x
            } else {
                zero
            }
        })
    }

    pub fn log(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "log", OpArgs::default(), f64::ln)
    }

    pub fn log1p(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "log1p", OpArgs::default(), f64::ln_1p)
    }

    pub fn exp(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "exp", OpArgs::default(), f64::exp)
    }

    pub fn expm1(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "expm1", OpArgs::default(), f64::exp_m1)
    }

    pub fn sigmoid(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "sigmoid", OpArgs::default(), sigmoid)
    }

    pub fn cos(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "cos", OpArgs::default(), f64::cos)
    }

    pub fn sin(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "sin", OpArgs::default(), f64::sin)
    }

    pub fn tan(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "tan", OpArgs::default(), f64::tan)
    }

    pub fn cosh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "cosh", OpArgs::default(), f64::cosh)
    }

    pub fn sinh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "sinh", OpArgs::default(), f64::sinh)
    }

    pub fn tanh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "tanh", OpArgs::default(), f64::tanh)
    }

    pub fn acos(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "acos", OpArgs::default(), f64::acos)
    }

    pub fn asin(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "asin", OpArgs::default(), f64::asin)
    }

    pub fn atan(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "atan", OpArgs::default(), f64::atan)
    }

    pub fn acosh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "acosh", OpArgs::default(), f64::acosh)
    }

    pub fn asinh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "asinh", OpArgs::default(), f64::asinh)
    }

    pub fn atanh(&self, t: &TapeSlot) -> NumDict {
        unary_op(t, self, "atanh", OpArgs::default(), f64::atanh)
    }

    pub fn scale(&self, t: &TapeSlot, val: f64) -> NumDict {
        unary_op(t, self, "scale", OpArgs::with_val(val), move |x| x * val)
    }

    pub fn shift(&self, t: &TapeSlot, val: f64) -> NumDict {
        unary_op(t, self, "shift", OpArgs::with_val(val), move |x| x + val)
    }

    pub fn powf(&self, t: &TapeSlot, val: f64) -> NumDict {
        unary_op(t, self, "pow", OpArgs::with_val(val), move |x| x.powf(val))
    }

    pub fn clip(&self, t: &TapeSlot, lo: f64, hi: f64) -> NumDict {
        unary_op(t, self, "clip", OpArgs::with_bounds(lo, hi), move |x| {
            x.max(lo).min(hi)
        })
    }

    pub fn sub(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "sub", by, |a, b| a - b)
    }

    pub fn div(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
    ) -> Result<NumDict, NumError> {
        binary_op(t, self, other, "div", by, |a, b| a / b)
    }

    // Full reductions onto the aggregate form.

    pub fn sum(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "sum", None, 0.0, kernel_sum)
    }

    pub fn prod(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "prod", None, 1.0, kernel_prod)
    }

    pub fn maximum(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "max", None, f64::NEG_INFINITY, kernel_max)
    }

    pub fn minimum(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "min", None, f64::INFINITY, kernel_min)
    }

    pub fn mean(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "mean", None, f64::NAN, kernel_mean)
    }

    pub fn stdev(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "stdev", None, f64::NAN, kernel_stdev)
    }

    pub fn variance(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "variance", None, f64::NAN, kernel_variance)
    }

    pub fn pstdev(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "pstdev", None, f64::NAN, kernel_pstdev)
    }

    pub fn pvariance(&self, t: &TapeSlot) -> Result<NumDict, NumError> {
        reduce_op(t, self, "pvariance", None, f64::NAN, kernel_pvariance)
    }

    // Grouped reductions onto a strictly coarser form.

    /// Sum each group of keys sharing a projection onto `by`.
    ///
    /// `by` must be strictly coarser than this dict's form; grouping by the
    /// dict's own form is an error, not an identity pass.
    pub fn sum_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "sum_by", Some(by), 0.0, kernel_sum)
    }

    pub fn prod_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "prod_by", Some(by), 1.0, kernel_prod)
    }

    pub fn maximum_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "max_by", Some(by), f64::NEG_INFINITY, kernel_max)
    }

    pub fn minimum_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "min_by", Some(by), f64::INFINITY, kernel_min)
    }

    pub fn mean_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "mean_by", Some(by), f64::NAN, kernel_mean)
    }

    pub fn stdev_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "stdev_by", Some(by), f64::NAN, kernel_stdev)
    }

    pub fn variance_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "variance_by", Some(by), f64::NAN, kernel_variance)
    }

    pub fn pstdev_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "pstdev_by", Some(by), f64::NAN, kernel_pstdev)
    }

    pub fn pvariance_by(&self, t: &TapeSlot, by: &KeyForm) -> Result<NumDict, NumError> {
        reduce_op(t, self, "pvariance_by", Some(by), f64::NAN, kernel_pvariance)
    }

    // Pointwise combination with aligned operands.

    pub fn sum_with(
        &self,
        t: &TapeSlot,
        others: &[&NumDict],
        by: &[Option<KeyForm>],
    ) -> Result<NumDict, NumError> {
        variadic_op(t, self, others, "sum_with", by, kernel_sum)
    }

    pub fn mul_with(
        &self,
        t: &TapeSlot,
        others: &[&NumDict],
        by: &[Option<KeyForm>],
    ) -> Result<NumDict, NumError> {
        variadic_op(t, self, others, "mul_with", by, kernel_prod)
    }

    pub fn max_with(
        &self,
        t: &TapeSlot,
        others: &[&NumDict],
        by: &[Option<KeyForm>],
    ) -> Result<NumDict, NumError> {
        variadic_op(t, self, others, "max_with", by, kernel_max)
    }

    pub fn min_with(
        &self,
        t: &TapeSlot,
        others: &[&NumDict],
        by: &[Option<KeyForm>],
    ) -> Result<NumDict, NumError> {
        variadic_op(t, self, others, "min_with", by, kernel_min)
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Carry a gradient from a fine form down onto `form`, summing the fibers.
/// The defaults of grouped sums are pinned to zero so accumulated
/// gradients stay finite.
pub(crate) fn project(
    t: &TapeSlot,
    g: &NumDict,
    form: &KeyForm,
) -> Result<NumDict, NumError> {
    if *form == g.form() {
        return Ok(g.clone());
    }
    let s = g.sum_by(t, form)?;
    Ok(s.with_default(t, 0.0))
}

fn req_val(args: &OpArgs) -> Result<f64, NumError> {
    args.val
        .ok_or_else(|| NumError::Value("missing recorded scalar argument".to_string()))
}

fn by_at<'a>(args: &'a OpArgs, i: usize) -> Option<&'a KeyForm> {
    args.by.get(i).and_then(|b| b.as_ref())
}

fn grad_neg(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    _d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![g.neg(t)])
}

fn grad_abs(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let sign = d[0].const_like(t, 1.0).copysign(t, &d[0], None)?;
    Ok(vec![sign.mul_with(t, &[g], &[])?])
}

fn grad_inv(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let dd = d[0].mul_with(t, &[&d[0]], &[])?.inv(t, 0.0).neg(t);
    Ok(vec![g.mul_with(t, &[&dd], &[])?])
}

fn grad_scale(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    _d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![g.scale(t, req_val(a)?)])
}

fn grad_shift(
    _t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    _d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![g.clone()])
}

fn grad_pow(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let val = req_val(a)?;
    let f = d[0].powf(t, val - 1.0).scale(t, val);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_log(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].inv(t, 0.0).mul_with(t, &[g], &[])?])
}

fn grad_log1p(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].shift(t, 1.0).inv(t, 0.0).mul_with(t, &[g], &[])?])
}

fn grad_exp(
    t: &TapeSlot,
    g: &NumDict,
    r: &NumDict,
    _d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![r.mul_with(t, &[g], &[])?])
}

fn grad_expm1(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].exp(t).mul_with(t, &[g], &[])?])
}

fn grad_sigmoid(
    t: &TapeSlot,
    g: &NumDict,
    r: &NumDict,
    _d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = r.neg(t).shift(t, 1.0).mul_with(t, &[r], &[])?;
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_cos(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].sin(t).neg(t).mul_with(t, &[g], &[])?])
}

fn grad_sin(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].cos(t).mul_with(t, &[g], &[])?])
}

fn grad_tan(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0].cos(t).inv(t, 0.0).powf(t, 2.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_cosh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].sinh(t).mul_with(t, &[g], &[])?])
}

fn grad_sinh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![d[0].cosh(t).mul_with(t, &[g], &[])?])
}

fn grad_tanh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0].cosh(t).inv(t, 0.0).powf(t, 2.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_acos(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0]
        .powf(t, 2.0)
        .neg(t)
        .shift(t, 1.0)
        .powf(t, 0.5)
        .inv(t, 0.0)
        .neg(t);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_asin(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0]
        .powf(t, 2.0)
        .neg(t)
        .shift(t, 1.0)
        .powf(t, 0.5)
        .inv(t, 0.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_atan(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0].powf(t, 2.0).shift(t, 1.0).inv(t, 0.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_acosh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0]
        .powf(t, 2.0)
        .shift(t, -1.0)
        .powf(t, 0.5)
        .inv(t, 0.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_asinh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0]
        .powf(t, 2.0)
        .shift(t, 1.0)
        .powf(t, 0.5)
        .inv(t, 0.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_atanh(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let f = d[0].powf(t, 2.0).neg(t).shift(t, 1.0).inv(t, 0.0);
    Ok(vec![f.mul_with(t, &[g], &[])?])
}

fn grad_clip(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let lo = a.lo.unwrap_or(f64::NEG_INFINITY);
    let hi = a.hi.unwrap_or(f64::INFINITY);
    Ok(vec![g.mul_with(t, &[&d[0].isbetween(t, lo, hi)], &[])?])
}

fn grad_sub(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let g2 = project(t, &g.neg(t), &d[1].form())?;
    Ok(vec![g.clone(), g2])
}

fn grad_div(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let by = vec![by_at(a, 0).cloned()];
    let d2_inv = d[1].inv(t, f64::NAN);
    let g1 = g.mul_with(t, &[&d2_inv], &by)?;
    let f = d2_inv.powf(t, 2.0).neg(t);
    let big = g
        .mul_with(t, &[&d[0]], &[])?
        .mul_with(t, &[&f], &by)?;
    let g2 = project(t, &big, &d[1].form())?;
    Ok(vec![g1, g2])
}

fn grad_sum_reduce(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    _a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    Ok(vec![g.expand(t, &d[0].index())?])
}

fn grad_minmax_reduce(
    t: &TapeSlot,
    g: &NumDict,
    r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let by = by_at(a, 0);
    let ind = d[0].eq(t, r, by)?;
    Ok(vec![ind.mul_with(t, &[g], &[by.cloned()])?])
}

fn grad_sum_with(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let mut gs = vec![g.clone()];
    for (i, other) in d[1..].iter().enumerate() {
        let form = match by_at(a, i) {
            Some(by) => by.clone(),
            None => other.form(),
        };
        gs.push(project(t, g, &form)?);
    }
    Ok(gs)
}

fn grad_mul_with(
    t: &TapeSlot,
    g: &NumDict,
    _r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let n = d.len();
    // Branch forms aligned with factors; the receiver needs none.
    let by: Vec<Option<KeyForm>> = std::iter::once(None)
        .chain((0..n - 1).map(|i| by_at(a, i).cloned()))
        .collect();
    // Prefix products of leading factors and suffix products of trailing
    // ones; the gradient of factor i is prefix[i] * suffix[i].
    let mut lhs = vec![d[0].const_like(t, 1.0).mul_with(t, &[g], &[])?];
    let mut rhs = vec![d[0].const_like(t, 1.0)];
    for i in 0..n - 1 {
        let f1 = &d[i];
        let f2 = &d[n - 1 - i];
        let l = lhs[lhs.len() - 1].mul_with(t, &[f1], &[by[i].clone()])?;
        let r = rhs[rhs.len() - 1].mul_with(t, &[f2], &[by[n - 1 - i].clone()])?;
        lhs.push(l);
        rhs.push(r);
    }
    let mut gs = Vec::with_capacity(n);
    for i in 0..n {
        let form = match &by[i] {
            Some(b) => b.clone(),
            None => d[i].form(),
        };
        let full = lhs[i].mul_with(t, &[&rhs[n - 1 - i]], &[])?;
        gs.push(project(t, &full, &form)?);
    }
    Ok(gs)
}

fn grad_minmax_with(
    t: &TapeSlot,
    g: &NumDict,
    r: &NumDict,
    d: &[NumDict],
    a: &OpArgs,
) -> Result<Vec<NumDict>, NumError> {
    let mut gs = vec![d[0].eq(t, r, None)?.mul_with(t, &[g], &[])?];
    for (i, other) in d[1..].iter().enumerate() {
        let by = by_at(a, i);
        let ind = r.eq(t, other, by)?;
        let full = ind.mul_with(t, &[g], &[])?;
        let form = match by {
            Some(by) => by.clone(),
            None => other.form(),
        };
        gs.push(project(t, &full, &form)?);
    }
    Ok(gs)
}

pub(crate) fn defs() -> Vec<OpDef> {
    vec![
        OpDef::new("neg", GradRule::Fn(grad_neg)),
        OpDef::new("abs", GradRule::Fn(grad_abs)),
        OpDef::new("inv", GradRule::Fn(grad_inv)),
        OpDef::new("log", GradRule::Fn(grad_log)),
        OpDef::new("log1p", GradRule::Fn(grad_log1p)),
        OpDef::new("exp", GradRule::Fn(grad_exp)),
        OpDef::new("expm1", GradRule::Fn(grad_expm1)),
        OpDef::new("sigmoid", GradRule::Fn(grad_sigmoid)),
        OpDef::new("cos", GradRule::Fn(grad_cos)),
        OpDef::new("sin", GradRule::Fn(grad_sin)),
        OpDef::new("tan", GradRule::Fn(grad_tan)),
        OpDef::new("cosh", GradRule::Fn(grad_cosh)),
        OpDef::new("sinh", GradRule::Fn(grad_sinh)),
        OpDef::new("tanh", GradRule::Fn(grad_tanh)),
        OpDef::new("acos", GradRule::Fn(grad_acos)),
        OpDef::new("asin", GradRule::Fn(grad_asin)),
        OpDef::new("atan", GradRule::Fn(grad_atan)),
        OpDef::new("acosh", GradRule::Fn(grad_acosh)),
        OpDef::new("asinh", GradRule::Fn(grad_asinh)),
        OpDef::new("atanh", GradRule::Fn(grad_atanh)),
        OpDef::new("scale", GradRule::Fn(grad_scale)),
        OpDef::new("shift", GradRule::Fn(grad_shift)),
        OpDef::new("pow", GradRule::Fn(grad_pow)),
        OpDef::new("clip", GradRule::Fn(grad_clip)),
        OpDef::new("sub", GradRule::Fn(grad_sub)),
        OpDef::new("div", GradRule::Fn(grad_div)),
        OpDef::new("sum", GradRule::Fn(grad_sum_reduce)),
        OpDef::new("sum_by", GradRule::Fn(grad_sum_reduce)),
        OpDef::new("sum_with", GradRule::Fn(grad_sum_with)),
        OpDef::new("prod", GradRule::Unimplemented),
        OpDef::new("prod_by", GradRule::Unimplemented),
        OpDef::new("mul_with", GradRule::Fn(grad_mul_with)),
        OpDef::new("max", GradRule::Fn(grad_minmax_reduce)),
        OpDef::new("max_by", GradRule::Fn(grad_minmax_reduce)),
        OpDef::new("max_with", GradRule::Fn(grad_minmax_with)),
        OpDef::new("min", GradRule::Fn(grad_minmax_reduce)),
        OpDef::new("min_by", GradRule::Fn(grad_minmax_reduce)),
        OpDef::new("min_with", GradRule::Fn(grad_minmax_with)),
        OpDef::new("mean", GradRule::Unimplemented),
        OpDef::new("mean_by", GradRule::Unimplemented),
        OpDef::new("stdev", GradRule::Unimplemented),
        OpDef::new("stdev_by", GradRule::Unimplemented),
        OpDef::new("variance", GradRule::Unimplemented),
        OpDef::new("variance_by", GradRule::Unimplemented),
        OpDef::new("pstdev", GradRule::Unimplemented),
        OpDef::new("pstdev_by", GradRule::Unimplemented),
        OpDef::new("pvariance", GradRule::Unimplemented),
        OpDef::new("pvariance_by", GradRule::Unimplemented),
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

    fn form(s: &str) -> KeyForm {
        KeyForm::from_key(&key(s)).unwrap()
    }

    fn fixture() -> (KeySpace, NumDict) {
        let ks = KeySpace::new();
        for s in ["m:f:x", "m:f:y", "m:g:x", "m:g:y"] {
            ks.ensure(&key(s)).unwrap();
        }
        let idx = Index::new(&ks, form("m:?:?")).unwrap();
        let d = NumDict::new(idx, BTreeMap::new(), 0.0).unwrap();
        (ks, d)
    }

    #[test]
    fn pointwise_ops_map_entries_and_default() {
        let (_ks, d) = fixture();
        d.mutable().unwrap().set(&key("m:f:x"), 3.0).unwrap();
        let t = TapeSlot::new();
        let r = d.neg(&t).shift(&t, 1.0);
        assert_eq!(r.default(), 1.0);
        assert_eq!(r.get(&key("m:f:x")).unwrap(), -2.0);
        assert_eq!(r.get(&key("m:g:y")).unwrap(), 1.0);
    }

    #[test]
    fn results_are_canonical() {
        let (_ks, d) = fixture();
        d.mutable().unwrap().set(&key("m:f:x"), 2.0).unwrap();
        let t = TapeSlot::new();
        // Entries landing on the new default are dropped.
        let r = d.scale(&t, 0.0);
        assert_eq!(r.num_entries(), 0);
        assert_eq!(r.default(), 0.0);
    }

    #[test]
    fn inv_maps_zero_to_sentinel() {
        let (_ks, d) = fixture();
        d.mutable().unwrap().set(&key("m:f:x"), 4.0).unwrap();
        let t = TapeSlot::new();
        let r = d.inv(&t, 7.0);
        assert_eq!(r.default(), 7.0);
        assert_eq!(r.get(&key("m:f:x")).unwrap(), 0.25);
    }

    #[test]
    fn sum_folds_the_whole_extent() {
        let (_ks, d) = fixture();
        d.mutable().unwrap().set(&key("m:f:x"), 3.0).unwrap();
        let t = TapeSlot::new();
        let e = d.with_default(&t, 1.0);
        // Default 1.0 is not the identity of +, so all 4 keys contribute.
        let total = e.sum(&t).unwrap();
        assert_eq!(total.get(&Key::root()).unwrap(), 6.0);
    }

    #[test]
    fn sum_with_identity_default_uses_entries_only() {
        let (_ks, d) = fixture();
        d.mutable().unwrap().set(&key("m:f:x"), 3.0).unwrap();
        let t = TapeSlot::new();
        let total = d.sum(&t).unwrap();
        assert_eq!(total.get(&Key::root()).unwrap(), 3.0);
    }

    #[test]
    fn grouped_sum_requires_a_coarser_form() {
        let (_ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("m:f:x"), 1.0).unwrap();
            m.set(&key("m:f:y"), 2.0).unwrap();
            m.set(&key("m:g:x"), 4.0).unwrap();
        }
        let t = TapeSlot::new();
        let by = form("m:?");
        let s = d.sum_by(&t, &by).unwrap();
        assert_eq!(s.get(&key("m:f")).unwrap(), 3.0);
        assert_eq!(s.get(&key("m:g")).unwrap(), 4.0);
        assert!(d.sum_by(&t, &d.form()).is_err());
    }

    #[test]
    fn variadic_sum_aligns_coarser_operands() {
        let (ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("m:f:x"), 1.0).unwrap();
            m.set(&key("m:g:y"), 2.0).unwrap();
        }
        let by = form("m:?");
        let e = NumDict::new(
            Index::new(&ks, by.clone()).unwrap(),
            BTreeMap::new(),
            0.0,
        )
        .unwrap();
        e.mutable().unwrap().set(&key("m:f"), 10.0).unwrap();
        let t = TapeSlot::new();
        let r = d.sum_with(&t, &[&e], &[Some(by)]).unwrap();
        assert_eq!(r.get(&key("m:f:x")).unwrap(), 11.0);
        assert_eq!(r.get(&key("m:f:y")).unwrap(), 10.0);
        assert_eq!(r.get(&key("m:g:y")).unwrap(), 2.0);
    }

    #[test]
    fn statistical_reductions() {
        let (_ks, d) = fixture();
        {
            let mut m = d.mutable().unwrap();
            m.set(&key("m:f:x"), 1.0).unwrap();
            m.set(&key("m:f:y"), 3.0).unwrap();
            m.set(&key("m:g:x"), 1.0).unwrap();
            m.set(&key("m:g:y"), 3.0).unwrap();
        }
        let t = TapeSlot::new();
        let m = d.mean(&t).unwrap();
        assert_eq!(m.get(&Key::root()).unwrap(), 2.0);
        let v = d.pvariance(&t).unwrap();
        assert_eq!(v.get(&Key::root()).unwrap(), 1.0);
    }
}
