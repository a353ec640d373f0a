//! Learning-rate schedule: linear warmup followed by cosine annealing or
//! multistep decay. Counted in optimizer steps.

use std::f64::consts::PI;

use crate::config::{OptimizerConfig, ScheduleType};
use crate::error::{CoreError, CoreResult};

/// Floor of the cosine schedule.
const ETA_MIN: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    kind: ScheduleType,
    milestones: Vec<usize>,
    gamma: f64,
}

impl LrSchedule {
    pub fn from_config(opt: &OptimizerConfig, steps_per_epoch: usize) -> CoreResult<Self> {
        if steps_per_epoch == 0 {
            return Err(CoreError::config("steps_per_epoch must be greater than 0"));
        }
        let warmup_steps = if opt.warmup {
            opt.warmup_epochs * steps_per_epoch
        } else {
            0
        };
        Ok(Self {
            base_lr: opt.learning_rate,
            warmup_steps,
            total_steps: warmup_steps + opt.epochs * steps_per_epoch,
            kind: opt.schedule_type,
            milestones: opt
                .schedule_steps
                .iter()
                .map(|m| warmup_steps + m * steps_per_epoch)
                .collect(),
            gamma: opt.schedule_gamma,
        })
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Learning rate for optimizer step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        match self.kind {
            ScheduleType::Cosine => {
                let span = (self.total_steps - self.warmup_steps).max(1) as f64;
                let progress = ((step - self.warmup_steps) as f64 / span).min(1.0);
                ETA_MIN + 0.5 * (self.base_lr - ETA_MIN) * (1.0 + (PI * progress).cos())
            }
            ScheduleType::Multistep => {
                let passed = self.milestones.iter().filter(|&&m| step >= m).count();
                self.base_lr * self.gamma.powi(passed as i32)
            }
        }
    }
}
