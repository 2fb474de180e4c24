use serde::{Deserialize, Serialize};

/// Linear warmup followed by inverse square root decay.
///
/// The rate peaks at `warmup_steps` and equals `base_lr` there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoamLr {
    base_lr: f64,
    warmup_steps: usize,
    last_step: usize,
}

impl NoamLr {
    /// Scheduler positioned at `restore_step` (0 for a fresh run)
    pub fn new(base_lr: f64, warmup_steps: usize, restore_step: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: warmup_steps.max(1),
            last_step: restore_step,
        }
    }

    /// Learning rate at `step`, steps below 1 are clamped to 1
    pub fn lr_at(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps as f64;
        self.base_lr * warmup.powf(0.5) * (step * warmup.powf(-1.5)).min(step.powf(-0.5))
    }

    pub fn step(&mut self) {
        self.last_step += 1;
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.last_step)
    }

    pub fn last_step(&self) -> usize {
        self.last_step
    }
}

/// Learning rate policy of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LearningRate {
    Constant(f64),
    Noam(NoamLr),
}

impl LearningRate {
    pub fn current_lr(&self) -> f64 {
        match self {
            LearningRate::Constant(lr) => *lr,
            LearningRate::Noam(noam) => noam.current_lr(),
        }
    }

    /// Advance one optimizer step, a no-op for constant rates
    pub fn step(&mut self) {
        if let LearningRate::Noam(noam) = self {
            noam.step();
        }
    }

    /// Step the scheduler was at, if it tracks one
    pub fn scheduler_step(&self) -> Option<usize> {
        match self {
            LearningRate::Constant(_) => None,
            LearningRate::Noam(noam) => Some(noam.last_step()),
        }
    }
}
