//! Periodic action scheduling
//!
//! Sampling, saving and logging all share one predicate, parameterized only
//! by their interval. The predicate is a pure function of
//! `(step, start_step, interval)` and holds no state.

/// Decide whether a periodic action fires on this step.
///
/// Never fires when the interval is absent or zero, and never on the exact
/// start/resume step (which would duplicate the action right after resume).
pub fn should_fire(step: u64, start_step: u64, interval: Option<u64>) -> bool {
    let interval = match interval {
        Some(i) if i > 0 => i,
        _ => return false,
    };
    if step == start_step {
        return false;
    }
    step % interval == 0
}

/// The three periodic cadences of a training job
#[derive(Debug, Clone, Copy, Default)]
pub struct Intervals {
    /// Sample every N steps
    pub sample: Option<u64>,

    /// Save every N steps
    pub save: Option<u64>,

    /// Emit scalar logs every N steps
    pub log: Option<u64>,
}

impl Intervals {
    /// Sampling due on this step
    pub fn sample_due(&self, step: u64, start_step: u64) -> bool {
        should_fire(step, start_step, self.sample)
    }

    /// Saving due on this step
    pub fn save_due(&self, step: u64, start_step: u64) -> bool {
        should_fire(step, start_step, self.save)
    }

    /// Logging due on this step
    pub fn log_due(&self, step: u64, start_step: u64) -> bool {
        should_fire(step, start_step, self.log)
    }
}
