//! Training state and controller phases

use serde::{Deserialize, Serialize};

/// Counters owned by the training loop controller.
///
/// Mutated only at the end of each completed step; `step` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Global step counter
    pub step: u64,

    /// Step counter snapshot taken at resume; periodic actions never fire
    /// while `step == start_step`
    pub start_step: u64,

    /// Epoch counter (advances when the data source wraps)
    pub epoch: u64,
}

impl TrainingState {
    /// Fresh state at step 0
    pub fn new() -> Self {
        Self {
            step: 0,
            start_step: 0,
            epoch: 0,
        }
    }

    /// Jump both counters to a resumed position
    pub fn resume_at(&mut self, step: u64, epoch: u64) {
        self.step = step;
        self.start_step = step;
        self.epoch = epoch;
    }

    /// Advance the step counter; the single mutation per completed step
    pub fn advance(&mut self) {
        self.step += 1;
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Controller lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No resources touched yet
    Uninitialized,
    /// Base model being loaded, precision flags applied
    ModelLoading,
    /// Trainable set selected, optimizer built, checkpoint resumed
    ParamSetup,
    /// Pre-training sample generation
    WarmupSample,
    /// Per-step loop
    Stepping,
    /// Final sample and unconditional save
    Finalizing,
    /// Terminal
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::ModelLoading => "model_loading",
            Phase::ParamSetup => "param_setup",
            Phase::WarmupSample => "warmup_sample",
            Phase::Stepping => "stepping",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}
