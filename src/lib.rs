//! Training-loop orchestration for generative image models
//!
//! `difftrain` drives fine-tuning runs for diffusion models (full backbone
//! or LoRA-style adapters) and autoencoders (with an optional adversarial
//! critic). It owns the loop lifecycle: configuration, checkpoint
//! persistence and resume, periodic sampling/saving/logging, loss
//! composition and optimizer scheduling. The numeric model architectures
//! stay behind the traits in [`backend`].
//!
//! # Example
//!
//! ```no_run
//! use difftrain::config::AutoencoderJobConfig;
//!
//! # fn main() -> difftrain::Result<()> {
//! let yaml = std::fs::read_to_string("job.yaml")?;
//! let cfg = AutoencoderJobConfig::from_yaml(&yaml)?;
//! println!("training {} on {}", cfg.job.name, cfg.job.device);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod metadata;
pub mod training;

pub use error::{Error, Result};
pub use training::controller::{LoopSettings, TrainLoop, TrainStrategy};
pub use training::trainers::{AutoencoderTrainer, DiffusionTrainer};
