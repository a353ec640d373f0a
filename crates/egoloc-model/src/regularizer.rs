//! Continual-learning regularizer.
//!
//! Keeps a per-parameter importance estimate and a frozen copy of the
//! parameters from the end of the previous task, and penalises drift from
//! that copy weighted by importance:
//!
//! ```text
//! penalty = reg_lambda * sum_p sum_i importance[p]_i * (theta[p]_i - anchor[p]_i)^2
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! NoPriorTask --begin_task--> TaskActive --begin_finalize--> TaskFinalizing
//!                                 ^                               |
//!                                 +---------complete_task---------+
//! ```
//!
//! Training steps read an immutable, versioned [`ImportanceSnapshot`] behind an
//! `Arc`. `begin_finalize` refuses to start while any step still holds one.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use egoloc_core::config::{ContinualConfig, RegularizerKind};

use crate::detector::DetectorOutput;
use crate::error::{ModelError, ModelResult};
use crate::ops;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegularizerState {
    NoPriorTask,
    TaskActive,
    TaskFinalizing,
}

/// Importance and anchor parameters as seen by training steps.
#[derive(Debug)]
pub struct ImportanceSnapshot {
    version: u64,
    importance: BTreeMap<String, Tensor>,
    anchors: BTreeMap<String, Tensor>,
}

impl ImportanceSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            importance: BTreeMap::new(),
            anchors: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True until the first task completes.
    pub fn is_empty(&self) -> bool {
        self.importance.is_empty()
    }

    pub fn importance(&self, name: &str) -> Option<&Tensor> {
        self.importance.get(name)
    }

    pub fn anchor(&self, name: &str) -> Option<&Tensor> {
        self.anchors.get(name)
    }

    /// Sum of every importance entry.
    pub fn total_importance(&self) -> ModelResult<f32> {
        let mut total = 0f32;
        for imp in self.importance.values() {
            total += imp.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total)
    }
}

fn named_vars(varmap: &VarMap) -> ModelResult<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn freeze_parameters(varmap: &VarMap) -> ModelResult<BTreeMap<String, Tensor>> {
    named_vars(varmap)?
        .into_iter()
        .map(|(name, var)| Ok((name, ops::detached(var.as_tensor())?)))
        .collect()
}

pub struct ContinualRegularizer {
    kind: Option<RegularizerKind>,
    reg_lambda: f32,
    state: RegularizerState,
    snapshot: Arc<ImportanceSnapshot>,
    /// Running importance, merged by addition at each task completion.
    importance: BTreeMap<String, Tensor>,
    /// Squared sensitivity gradients summed over the finalizing task's batches.
    pending: BTreeMap<String, Tensor>,
    pending_batches: usize,
    tasks_completed: usize,
}

impl ContinualRegularizer {
    pub fn new(cl: &ContinualConfig) -> Self {
        Self {
            kind: cl.name,
            reg_lambda: cl.reg_lambda,
            state: RegularizerState::NoPriorTask,
            snapshot: Arc::new(ImportanceSnapshot::empty()),
            importance: BTreeMap::new(),
            pending: BTreeMap::new(),
            pending_batches: 0,
            tasks_completed: 0,
        }
    }

    pub fn kind(&self) -> Option<RegularizerKind> {
        self.kind
    }

    pub fn state(&self) -> RegularizerState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed
    }

    fn expect_state(&self, expected: RegularizerState, op: &str) -> ModelResult<()> {
        if self.state != expected {
            return Err(ModelError::sequencing(format!(
                "{op} requires state {expected:?}, regularizer is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Start the first task: freeze the parameters, importance stays empty.
    pub fn begin_task(&mut self, varmap: &VarMap) -> ModelResult<()> {
        self.expect_state(RegularizerState::NoPriorTask, "begin_task")?;
        self.snapshot = Arc::new(ImportanceSnapshot {
            version: 0,
            importance: BTreeMap::new(),
            anchors: freeze_parameters(varmap)?,
        });
        self.state = RegularizerState::TaskActive;
        info!(kind = ?self.kind, "Regularizer: NoPriorTask -> TaskActive");
        Ok(())
    }

    /// Handle for one training step.
    pub fn snapshot(&self) -> Arc<ImportanceSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Penalty for the current parameters, differentiable with respect to them.
    ///
    /// Zero when no variant is selected or no task has completed yet.
    pub fn penalty(&self, varmap: &VarMap, snapshot: &ImportanceSnapshot, device: &Device) -> ModelResult<Tensor> {
        let zero = Tensor::zeros((), DType::F32, device)?;
        if self.kind.is_none() || snapshot.is_empty() || self.reg_lambda == 0.0 {
            return Ok(zero);
        }
        let mut total = zero;
        for (name, var) in named_vars(varmap)? {
            let (Some(imp), Some(anchor)) = (snapshot.importance(&name), snapshot.anchor(&name)) else {
                continue;
            };
            let drift = var.as_tensor().sub(anchor)?.sqr()?;
            total = total.add(&drift.mul(imp)?.sum_all()?)?;
        }
        Ok(total.affine(self.reg_lambda as f64, 0.0)?)
    }

    /// Enter finalization. Fails while any training step still holds a snapshot.
    pub fn begin_finalize(&mut self) -> ModelResult<()> {
        self.expect_state(RegularizerState::TaskActive, "begin_finalize")?;
        let holders = Arc::strong_count(&self.snapshot) - 1;
        if holders > 0 {
            return Err(ModelError::sequencing(format!(
                "cannot finalize task: {holders} importance snapshot handle(s) still in use"
            )));
        }
        self.pending.clear();
        self.pending_batches = 0;
        self.state = RegularizerState::TaskFinalizing;
        info!(version = self.version(), "Regularizer: TaskActive -> TaskFinalizing");
        Ok(())
    }

    /// Scalar whose gradient measures parameter sensitivity for one batch.
    ///
    /// MAS uses the squared L2 norm of every head output; EWC the detection
    /// loss. `None` when no variant is selected.
    pub fn sensitivity(&self, output: &DetectorOutput, detection_loss: Option<&Tensor>) -> ModelResult<Option<Tensor>> {
        match self.kind {
            None => Ok(None),
            Some(RegularizerKind::Mas) => Ok(Some(output.output_energy()?)),
            Some(RegularizerKind::Ewc) => detection_loss
                .cloned()
                .map(Some)
                .ok_or_else(|| ModelError::config("EWC importance requires the detection loss")),
        }
    }

    /// Add the squared gradients of one batch's sensitivity.
    pub fn accumulate(&mut self, varmap: &VarMap, grads: &GradStore) -> ModelResult<()> {
        self.expect_state(RegularizerState::TaskFinalizing, "accumulate")?;
        for (name, var) in named_vars(varmap)? {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sq = ops::detached(&grad.sqr()?)?;
            let merged = match self.pending.remove(&name) {
                Some(prev) => prev.add(&sq)?,
                None => sq,
            };
            self.pending.insert(name, merged);
        }
        self.pending_batches += 1;
        debug!(batches = self.pending_batches, "Accumulated importance batch");
        Ok(())
    }

    /// Merge the averaged squared gradients into the running importance,
    /// re-anchor the parameters and return to `TaskActive`.
    ///
    /// Nothing is committed unless every merge succeeds.
    pub fn complete_task(&mut self, varmap: &VarMap) -> ModelResult<()> {
        self.expect_state(RegularizerState::TaskFinalizing, "complete_task")?;
        if self.pending_batches == 0 && self.kind.is_some() {
            warn!("Completing task without any importance batches; importance unchanged");
        }
        let scale = 1.0 / self.pending_batches.max(1) as f64;
        let mut importance = self.importance.clone();
        for (name, sum) in &self.pending {
            let avg = sum.affine(scale, 0.0)?;
            let merged = match importance.get(name) {
                Some(prev) => prev.add(&avg)?,
                None => avg,
            };
            importance.insert(name.clone(), merged);
        }
        let anchors = freeze_parameters(varmap)?;

        self.importance = importance;
        self.pending.clear();
        self.pending_batches = 0;
        self.tasks_completed += 1;
        self.snapshot = Arc::new(ImportanceSnapshot {
            version: self.snapshot.version + 1,
            importance: self.importance.clone(),
            anchors,
        });
        self.state = RegularizerState::TaskActive;
        info!(
            version = self.version(),
            tasks_completed = self.tasks_completed,
            parameters = self.importance.len(),
            "Regularizer: TaskFinalizing -> TaskActive"
        );
        Ok(())
    }

    /// Leave a failed finalization: the partial sums are dropped and the
    /// current task stays active with the previous snapshot.
    pub fn abort_finalize(&mut self) -> ModelResult<()> {
        self.expect_state(RegularizerState::TaskFinalizing, "abort_finalize")?;
        self.pending.clear();
        self.pending_batches = 0;
        self.state = RegularizerState::TaskActive;
        warn!(version = self.version(), "Regularizer: TaskFinalizing aborted -> TaskActive");
        Ok(())
    }

    /// Training steps are only allowed while a task is active.
    pub fn ensure_training(&self) -> ModelResult<()> {
        self.expect_state(RegularizerState::TaskActive, "training step")
    }
}
