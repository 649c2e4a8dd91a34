//! Training loop orchestration
//!
//! The [`controller::TrainLoop`] drives the lifecycle shared by every job
//! kind; [`trainers`] holds the job-specific strategies plugged into it.
//! Everything else in this module is the supporting machinery: checkpoint
//! persistence, periodic scheduling, batch cycling, loss bookkeeping,
//! optimizer factories and sample request construction.

pub mod checkpoints;
pub mod controller;
pub mod critic;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod sampler;
pub mod schedule;
pub mod state;
pub mod trainers;

#[cfg(test)]
mod tests;

pub use checkpoints::{checkpoint_path, CheckpointStore, CRITIC_PREFIX};
pub use controller::{LoopSettings, TrainLoop, TrainStrategy};
pub use critic::Critic;
pub use data::{BatchSource, CyclingSource, VecSource};
pub use loss::{LossComposer, LossWeights};
pub use metrics::{JsonlSink, LossAccumulator, LossBreakdown, MetricSink};
pub use optimizers::{create_optimizer, create_scheduler, effective_lr, LrSchedule, Optim};
pub use sampler::{build_image_requests, build_prompt_requests, SampleRequest};
pub use schedule::{should_fire, Intervals};
pub use state::{Phase, TrainingState};
pub use trainers::{AutoencoderTrainer, DiffusionTrainer};
