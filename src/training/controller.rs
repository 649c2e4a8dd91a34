//! Training loop controller
//!
//! [`TrainLoop`] owns the lifecycle shared by every job kind: load the
//! model, select trainable parameters, resume from the latest checkpoint,
//! take a warmup sample, run the step loop with periodic sample/save/log
//! actions, then take a final sample and an unconditional final save. The
//! job-specific numerics live behind [`TrainStrategy`]; the controller never
//! touches tensors beyond handing batches to the strategy.
//!
//! Step accounting: `state.step` counts completed steps. Periodic gates are
//! checked at the top of each iteration, so a save carries exactly the
//! number of steps already executed and resuming from it replays nothing.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::metadata::{build_metadata, parse_training_info};
use crate::training::checkpoints::{checkpoint_path, CheckpointStore};
use crate::training::data::{BatchSource, CyclingSource};
use crate::training::metrics::{LossBreakdown, MetricSink};
use crate::training::schedule::Intervals;
use crate::training::state::{Phase, TrainingState};

/// Loop-level settings shared by every job kind
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Job name, used for checkpoint and log naming
    pub job_name: String,

    /// Directory holding checkpoints and samples for this job
    pub save_root: PathBuf,

    /// Total step budget
    pub total_steps: u64,

    /// Periodic cadences
    pub intervals: Intervals,

    /// A distinct first-sample configuration exists; it renders before the
    /// baseline sample and is not subject to `skip_first_sample`
    pub has_first_sample: bool,

    /// Skip the baseline sample before the first step
    pub skip_first_sample: bool,

    /// Intermediate checkpoints retained
    pub max_step_saves_to_keep: usize,

    /// Base model identification written into checkpoint metadata
    /// (diffusion jobs only)
    pub base_model: Option<ModelConfig>,
}

/// Job-specific training behavior plugged into the controller.
///
/// The controller drives these hooks in a fixed order; implementations own
/// the model backends, optimizer and loss bookkeeping.
pub trait TrainStrategy {
    /// Batch type consumed by one training step
    type Batch;

    /// Device the job runs on
    fn device(&self) -> Device;

    /// Load the base model
    fn load_model(&mut self) -> Result<()>;

    /// Select the trainable parameter set
    fn prepare_trainable(&mut self) -> Result<()>;

    /// Restore trainable weights from a checkpoint
    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;

    /// Build optimizer and schedule. `total_steps` is always the full
    /// configured horizon, `start_step` the resume position.
    fn build_optimizer(&mut self, total_steps: u64, start_step: u64) -> Result<()>;

    /// Execute one optimization step
    fn train_step(&mut self, batch: &Self::Batch) -> Result<LossBreakdown>;

    /// Applied learning rate, for progress reporting
    fn learning_rate(&self) -> f64;

    /// Collect the weights that go into a checkpoint
    fn collect_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Called after each successful checkpoint write, with the metadata
    /// that was saved. Sibling artifacts (a critic checkpoint) save here.
    fn on_saved(&mut self, step: Option<u64>, metadata: &HashMap<String, String>) -> Result<()>;

    /// Render preview samples. `step` is `None` before any training on a
    /// fresh run; `first` selects the distinct first-sample configuration
    /// instead of the steady-state one.
    fn sample(&mut self, step: Option<u64>, first: bool) -> Result<()>;

    /// Emit windowed scalar metrics for the progress log
    fn emit_logs(&mut self, step: u64, sink: &mut dyn MetricSink) -> Result<()>;

    /// Called when the data source wraps, closing an epoch
    fn on_epoch_end(&mut self, epoch: u64, sink: Option<&mut (dyn MetricSink + '_)>)
        -> Result<()>;

    /// Release resources at the end of the run
    fn finalize(&mut self) -> Result<()>;
}

/// The training loop controller
pub struct TrainLoop<S: TrainStrategy> {
    settings: LoopSettings,
    strategy: S,
    store: CheckpointStore,
    state: TrainingState,
    phase: Phase,
    sink: Option<Box<dyn MetricSink>>,
}

impl<S: TrainStrategy> TrainLoop<S> {
    pub fn new(settings: LoopSettings, strategy: S) -> Result<Self> {
        if settings.total_steps == 0 {
            return Err(Error::config("total step budget must be positive"));
        }
        let store = CheckpointStore::new(strategy.device());
        Ok(Self {
            settings,
            strategy,
            store,
            state: TrainingState::new(),
            phase: Phase::Uninitialized,
            sink: None,
        })
    }

    /// Attach a metric sink for periodic scalar logging
    pub fn with_sink(mut self, sink: Box<dyn MetricSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run the job to completion over `source`
    pub fn run(&mut self, source: impl BatchSource<Batch = S::Batch>) -> Result<()> {
        self.enter(Phase::ModelLoading);
        self.strategy.load_model()?;

        self.enter(Phase::ParamSetup);
        self.strategy.prepare_trainable()?;
        self.resume_if_possible()?;
        self.strategy
            .build_optimizer(self.settings.total_steps, self.state.start_step)?;

        self.enter(Phase::WarmupSample);
        let step = (self.state.step > 0).then_some(self.state.step);
        if self.settings.has_first_sample {
            self.strategy.sample(step, true)?;
        }
        if !self.settings.skip_first_sample {
            self.strategy.sample(step, false)?;
        }

        self.enter(Phase::Stepping);
        let mut cycling = CyclingSource::new(source);
        while self.state.step < self.settings.total_steps {
            let step = self.state.step;
            let start = self.state.start_step;

            if self.settings.intervals.sample_due(step, start) {
                self.strategy.sample(Some(step), false)?;
            }
            if self.settings.intervals.save_due(step, start) {
                self.save_checkpoint(Some(step))?;
            }
            if self.settings.intervals.log_due(step, start) {
                self.emit_progress(step)?;
            }

            let (batch, wrapped) = cycling.next_cycled()?;
            if wrapped {
                let closing = self.state.epoch;
                self.strategy
                    .on_epoch_end(closing, self.sink.as_deref_mut())?;
                self.state.epoch += 1;
                debug!(epoch = self.state.epoch, step, "epoch boundary");
            }

            self.strategy.train_step(&batch)?;
            self.flush_device();
            self.state.advance();
        }

        self.enter(Phase::Finalizing);
        self.strategy.sample(Some(self.state.step), false)?;
        self.save_checkpoint(None)?;
        self.strategy.finalize()?;
        self.enter(Phase::Done);
        info!(job = %self.settings.job_name, steps = self.state.step, "training complete");
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        debug!(phase = %phase, "phase change");
    }

    /// Restore the newest checkpoint for this job, if any.
    ///
    /// A present-but-unreadable checkpoint is fatal; a readable checkpoint
    /// without counters restores weights and starts counting from zero.
    fn resume_if_possible(&mut self) -> Result<()> {
        let latest = self.store.find_latest(
            &self.settings.job_name,
            &self.settings.save_root,
            "",
        );
        let Some(path) = latest else {
            return Ok(());
        };
        let (weights, meta) = self.store.load(&path)?;
        self.strategy.load_weights(weights)?;
        match parse_training_info(&meta) {
            Some(info) => {
                self.state.resume_at(info.step, info.epoch);
                info!(
                    path = %path.display(),
                    step = info.step,
                    epoch = info.epoch,
                    "resumed from checkpoint"
                );
            }
            None => {
                warn!(
                    path = %path.display(),
                    "checkpoint carries no training counters, starting from step 0"
                );
            }
        }
        Ok(())
    }

    fn save_checkpoint(&mut self, step: Option<u64>) -> Result<()> {
        let metadata = build_metadata(
            &self.settings.job_name,
            &self.state,
            self.settings.base_model.as_ref(),
        );
        let weights = self.strategy.collect_weights()?;
        let path = checkpoint_path(&self.settings.save_root, "", &self.settings.job_name, step);
        self.store.save(&weights, &metadata, &path)?;
        self.store.prune(
            &self.settings.job_name,
            &self.settings.save_root,
            self.settings.max_step_saves_to_keep,
        );
        self.strategy.on_saved(step, &metadata)
    }

    fn emit_progress(&mut self, step: u64) -> Result<()> {
        let lr = self.strategy.learning_rate();
        if let Some(sink) = self.sink.as_mut() {
            sink.scalar("lr", lr, step)?;
            self.strategy.emit_logs(step, sink.as_mut())?;
        }
        info!(step, lr, "progress");
        Ok(())
    }

    /// Wait for queued device work so step timing stays honest; a failed
    /// flush is not worth aborting the run over
    fn flush_device(&self) {
        if let Err(e) = self.strategy.device().synchronize() {
            debug!(error = %e, "device flush failed");
        }
    }
}
