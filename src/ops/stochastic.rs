//! Random variate generation, keyed by parameter dicts.
//!
//! The receiver holds the primary parameter (rate, shape, or location);
//! two-parameter families take the second parameter as an aligned operand.
//! A NaN default restricts sampling to the explicit entries, otherwise the
//! full extent is drawn. Results always carry a NaN default, so downstream
//! operations stay on the sampled keys.
//!
//! Sampling records on the tape like any other operation, but none of
//! these ops has a gradient.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Distribution, Exp, Gamma, LogNormal, Normal, Pareto};

use crate::error::NumError;
use crate::key::Key;
use crate::keyform::KeyForm;
use crate::numdict::{Mode, NumDict};
use crate::tape::TapeSlot;

use super::{GradRule, OpArgs, OpDef};

impl NumDict {
    fn variate_keys(&self) -> Vec<Key> {
        if self.default().is_nan() {
            self.entries().into_iter().map(|(k, _)| k).collect()
        } else {
            self.keys()
        }
    }

    fn unary_variate<R, F>(
        &self,
        t: &TapeSlot,
        rng: &mut R,
        name: &'static str,
        mut kernel: F,
    ) -> Result<NumDict, NumError>
    where
        R: Rng,
        F: FnMut(&mut R, f64) -> Result<f64, NumError>,
    {
        let mut map = BTreeMap::new();
        for k in self.variate_keys() {
            let v = kernel(rng, self.peek(&k))?;
            map.insert(k, v);
        }
        let r = self.with_same_index(map, f64::NAN);
        t.record(name, &r, &[self], OpArgs::default());
        Ok(r)
    }

    fn binary_variate<R, F>(
        &self,
        t: &TapeSlot,
        other: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
        name: &'static str,
        mut kernel: F,
    ) -> Result<NumDict, NumError>
    where
        R: Rng,
        F: FnMut(&mut R, f64, f64) -> Result<f64, NumError>,
    {
        let mode = if self.default().is_nan() {
            Mode::Own
        } else {
            Mode::Full
        };
        let branches = vec![by.cloned()];
        let mut map = BTreeMap::new();
        for (k, vs) in self.collect(&[other], mode, &branches)? {
            let v = kernel(rng, vs[0], vs[1])?;
            map.insert(k, v);
        }
        let r = self.with_same_index(map, f64::NAN);
        t.record(name, &r, &[self, other], OpArgs::with_by(branches));
        Ok(r)
    }

    /// Standard uniform draw per key; values are ignored.
    pub fn uniformvariate<R: Rng>(&self, t: &TapeSlot, rng: &mut R) -> Result<NumDict, NumError> {
        self.unary_variate(t, rng, "uniformvariate", |rng, _| Ok(rng.gen::<f64>()))
    }

    /// Exponential draw per key; values are the rates.
    pub fn expovariate<R: Rng>(&self, t: &TapeSlot, rng: &mut R) -> Result<NumDict, NumError> {
        self.unary_variate(t, rng, "expovariate", |rng, rate| {
            let dist = Exp::new(rate)
                .map_err(|_| NumError::Arithmetic(format!("bad exponential rate {}", rate)))?;
            Ok(dist.sample(rng))
        })
    }

    /// Pareto draw per key; values are the shape parameters.
    pub fn paretovariate<R: Rng>(&self, t: &TapeSlot, rng: &mut R) -> Result<NumDict, NumError> {
        self.unary_variate(t, rng, "paretovariate", |rng, alpha| {
            let dist = Pareto::new(1.0, alpha)
                .map_err(|_| NumError::Arithmetic(format!("bad pareto shape {}", alpha)))?;
            Ok(dist.sample(rng))
        })
    }

    /// Normal draw with means from `self` and deviations from `sigma`.
    pub fn normalvariate<R: Rng>(
        &self,
        t: &TapeSlot,
        sigma: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, sigma, by, rng, "normalvariate", |rng, m, s| {
            let dist = Normal::new(m, s)
                .map_err(|_| NumError::Arithmetic(format!("bad normal deviation {}", s)))?;
            Ok(dist.sample(rng))
        })
    }

    /// Log-normal draw; `self` and `sigma` parameterize the underlying
    /// normal.
    pub fn lognormvariate<R: Rng>(
        &self,
        t: &TapeSlot,
        sigma: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, sigma, by, rng, "lognormvariate", |rng, m, s| {
            let dist = LogNormal::new(m, s)
                .map_err(|_| NumError::Arithmetic(format!("bad log-normal deviation {}", s)))?;
            Ok(dist.sample(rng))
        })
    }

    /// Von Mises draw with mean angles from `self` and concentrations from
    /// `kappa`.
    pub fn vonmisesvariate<R: Rng>(
        &self,
        t: &TapeSlot,
        kappa: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, kappa, by, rng, "vonmisesvariate", |rng, mu, kappa| {
            if kappa < 0.0 {
                return Err(NumError::Arithmetic(format!(
                    "bad von mises concentration {}",
                    kappa
                )));
            }
            Ok(von_mises(rng, mu, kappa))
        })
    }

    /// Gamma draw with shapes from `self` and scales from `beta`.
    pub fn gammavariate<R: Rng>(
        &self,
        t: &TapeSlot,
        beta: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, beta, by, rng, "gammavariate", |rng, shape, scale| {
            let dist = Gamma::new(shape, scale).map_err(|_| {
                NumError::Arithmetic(format!("bad gamma parameters ({}, {})", shape, scale))
            })?;
            Ok(dist.sample(rng))
        })
    }

    /// Logistic draw with locations from `self` and scales from `scale`.
    pub fn logisticvariate<R: Rng>(
        &self,
        t: &TapeSlot,
        scale: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, scale, by, rng, "logisticvariate", |rng, m, s| {
            let u = rng.gen::<f64>();
            Ok(m + s * (u.ln() - (-u).ln_1p()))
        })
    }

    /// Gumbel draw with locations from `self` and scales from `beta`.
    pub fn gumbelvariate<R: Rng>(
        &self,
        t: &TapeSlot,
        beta: &NumDict,
        by: Option<&KeyForm>,
        rng: &mut R,
    ) -> Result<NumDict, NumError> {
        self.binary_variate(t, beta, by, rng, "gumbelvariate", |rng, m, b| {
            let u = rng.gen::<f64>();
            Ok(m - b * (-u.ln()).ln())
        })
    }
}

/// Best-Fisher rejection sampler for the von Mises distribution.
fn von_mises<R: Rng>(rng: &mut R, mu: f64, kappa: f64) -> f64 {
    let two_pi = 2.0 * PI;
    if kappa <= 1e-6 {
        return two_pi * rng.gen::<f64>();
    }
    let s = 0.5 / kappa;
    let r = s + (1.0 + s * s).sqrt();
    let z = loop {
        let u1 = rng.gen::<f64>();
        let z = (PI * u1).cos();
        let d = z / (r + z);
        let u2 = rng.gen::<f64>();
        if u2 < 1.0 - d * d || u2 <= (1.0 - d) * d.exp() {
            break z;
        }
    };
    let q = 1.0 / r;
    let f = (q + z) / (1.0 + q * z);
    let theta = if rng.gen::<f64>() > 0.5 {
        mu + f.acos()
    } else {
        mu - f.acos()
    };
    theta.rem_euclid(two_pi)
}

pub(crate) fn defs() -> Vec<OpDef> {
    vec![
        OpDef::new("uniformvariate", GradRule::Unimplemented),
        OpDef::new("expovariate", GradRule::Unimplemented),
        OpDef::new("paretovariate", GradRule::Unimplemented),
        OpDef::new("normalvariate", GradRule::Unimplemented),
        OpDef::new("lognormvariate", GradRule::Unimplemented),
        OpDef::new("vonmisesvariate", GradRule::Unimplemented),
        OpDef::new("gammavariate", GradRule::Unimplemented),
        OpDef::new("logisticvariate", GradRule::Unimplemented),
        OpDef::new("gumbelvariate", GradRule::Unimplemented),
    ]
}
