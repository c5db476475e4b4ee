//! Reverse-mode gradient tape.
//!
//! A [`TapeSlot`] owns at most one active [`Tape`] plus the operation
//! registry consulted during backward passes. Operations call
//! [`TapeSlot::record`]; with no active tape (or inside a pause scope) that
//! is a no-op, so the same forward code runs with or without recording.
//!
//! Cells are appended in forward execution order, which makes a reverse
//! walk over cell indices a valid reverse topological order of the data
//! flow. Gradients accumulate per cell; dicts registered on the tape are
//! write-locked until the tape is reset.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::error::TapeError;
use crate::numdict::NumDict;
use crate::ops::{GradRule, OpArgs, OpRegistry};

struct TapeCell {
    value: NumDict,
    /// Registry name, or `None` for a leaf registered as an operand.
    op: Option<&'static str>,
    operands: Vec<usize>,
    args: OpArgs,
}

/// A finished or in-progress recording.
pub struct Tape {
    cells: Vec<TapeCell>,
    by_ptr: HashMap<usize, usize>,
    persistent: bool,
    paused: u32,
    blocked: HashSet<usize>,
}

impl Tape {
    fn new(persistent: bool) -> Tape {
        Tape {
            cells: Vec::new(),
            by_ptr: HashMap::new(),
            persistent,
            paused: 0,
            blocked: HashSet::new(),
        }
    }

    fn intern(&mut self, d: &NumDict) -> usize {
        if let Some(&idx) = self.by_ptr.get(&d.ptr_id()) {
            return idx;
        }
        self.push_cell(d, None, Vec::new(), OpArgs::default())
    }

    fn push_cell(
        &mut self,
        d: &NumDict,
        op: Option<&'static str>,
        operands: Vec<usize>,
        args: OpArgs,
    ) -> usize {
        let idx = self.cells.len();
        self.by_ptr.insert(d.ptr_id(), idx);
        d.inner.borrow_mut().recorded += 1;
        self.cells.push(TapeCell {
            value: d.clone(),
            op,
            operands,
            args,
        });
        idx
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Treat a recorded value as a constant: the backward pass stops there.
    pub fn block(&mut self, d: &NumDict) -> Result<(), TapeError> {
        match self.by_ptr.get(&d.ptr_id()) {
            Some(&idx) => {
                self.blocked.insert(idx);
                Ok(())
            }
            None => Err(TapeError::NotOnTape),
        }
    }

    /// Gradients of `output` with respect to each of `variables`.
    ///
    /// `seed` overrides the initial gradient (all ones over the output's
    /// extent). Unless the tape is persistent, the recording is consumed.
    pub fn gradients(
        &mut self,
        slot: &TapeSlot,
        output: &NumDict,
        variables: &[&NumDict],
        seed: Option<&NumDict>,
    ) -> Result<Vec<NumDict>, TapeError> {
        if slot.is_active() {
            return Err(TapeError::Recording);
        }
        let out_idx = *self
            .by_ptr
            .get(&output.ptr_id())
            .ok_or(TapeError::NotOnTape)?;
        let mut var_idx = Vec::with_capacity(variables.len());
        for v in variables {
            var_idx.push(*self.by_ptr.get(&v.ptr_id()).ok_or(TapeError::NotOnTape)?);
        }
        let mut deltas: Vec<Option<NumDict>> = Vec::new();
        deltas.resize_with(self.cells.len(), || None);
        deltas[out_idx] = Some(match seed {
            Some(s) => s.clone(),
            None => const_like(output, 1.0),
        });
        for i in (0..=out_idx).rev() {
            let g = match &deltas[i] {
                Some(g) => g.clone(),
                None => continue,
            };
            if self.blocked.contains(&i) {
                continue;
            }
            let name = match self.cells[i].op {
                Some(name) => name,
                None => continue,
            };
            let def = slot
                .registry
                .get(name)
                .ok_or_else(|| TapeError::UnknownOp(name.to_string()))?;
            let gfn = match &def.grad {
                GradRule::Zero => continue,
                GradRule::Unimplemented => {
                    return Err(TapeError::UnimplementedGrad(name.to_string()))
                }
                GradRule::Fn(gfn) => *gfn,
            };
            let inputs: Vec<NumDict> = self.cells[i]
                .operands
                .iter()
                .map(|&j| self.cells[j].value.clone())
                .collect();
            let gs = gfn(slot, &g, &self.cells[i].value, &inputs, &self.cells[i].args)?;
            if gs.len() != inputs.len() {
                return Err(TapeError::Num(crate::error::NumError::Value(format!(
                    "op '{}' returned {} gradients for {} operands",
                    name,
                    gs.len(),
                    inputs.len()
                ))));
            }
            for (&j, gj) in self.cells[i].operands.iter().zip(gs) {
                let acc = match deltas[j].take() {
                    Some(cur) => cur.sum_with(slot, &[&gj], &[])?,
                    None => gj,
                };
                deltas[j] = Some(acc);
            }
        }
        let mut result = Vec::with_capacity(variables.len());
        for (v, idx) in variables.iter().zip(var_idx) {
            result.push(match deltas[idx].take() {
                Some(g) => g,
                None => const_like(v, 0.0),
            });
        }
        if !self.persistent {
            self.reset();
        }
        Ok(result)
    }

    /// Release every recorded dict and forget the recording.
    pub fn reset(&mut self) {
        for cell in self.cells.drain(..) {
            let mut inner = cell.value.inner.borrow_mut();
            inner.recorded = inner.recorded.saturating_sub(1);
        }
        self.by_ptr.clear();
        self.blocked.clear();
    }
}

impl Drop for Tape {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Recording context threaded through every differentiable operation.
pub struct TapeSlot {
    active: RefCell<Option<Tape>>,
    registry: Rc<OpRegistry>,
}

impl TapeSlot {
    pub fn new() -> TapeSlot {
        TapeSlot::with_registry(Rc::new(OpRegistry::standard()))
    }

    pub fn with_registry(registry: Rc<OpRegistry>) -> TapeSlot {
        TapeSlot {
            active: RefCell::new(None),
            registry,
        }
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active.borrow().is_some()
    }

    /// Start recording. Tapes do not stack.
    pub fn begin(&self, persistent: bool) -> Result<(), TapeError> {
        let mut active = self.active.borrow_mut();
        if active.is_some() {
            return Err(TapeError::Nested);
        }
        *active = Some(Tape::new(persistent));
        Ok(())
    }

    /// Stop recording and hand the tape back for backward passes.
    pub fn end(&self) -> Result<Tape, TapeError> {
        self.active.borrow_mut().take().ok_or(TapeError::Inactive)
    }

    /// Suspend recording until the guard drops.
    pub fn pause(&self) -> PauseGuard<'_> {
        if let Some(tape) = self.active.borrow_mut().as_mut() {
            tape.paused += 1;
        }
        PauseGuard { slot: self }
    }

    /// Mark an already-recorded value as a constant for backward passes.
    pub fn block(&self, d: &NumDict) -> Result<(), TapeError> {
        match self.active.borrow_mut().as_mut() {
            Some(tape) => tape.block(d),
            None => Err(TapeError::Inactive),
        }
    }

    /// Register an operation result. No-op when nothing is recording.
    pub fn record(&self, name: &'static str, result: &NumDict, operands: &[&NumDict], args: OpArgs) {
        let mut active = self.active.borrow_mut();
        let tape = match active.as_mut() {
            Some(tape) if tape.paused == 0 => tape,
            _ => return,
        };
        let ids: Vec<usize> = operands.iter().map(|d| tape.intern(d)).collect();
        tape.push_cell(result, Some(name), ids, args);
    }
}

impl Default for TapeSlot {
    fn default() -> Self {
        TapeSlot::new()
    }
}

pub struct PauseGuard<'a> {
    slot: &'a TapeSlot,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Some(tape) = self.slot.active.borrow_mut().as_mut() {
            tape.paused = tape.paused.saturating_sub(1);
        }
    }
}

fn const_like(d: &NumDict, c: f64) -> NumDict {
    NumDict::from_parts(d.index(), BTreeMap::new(), c)
}
