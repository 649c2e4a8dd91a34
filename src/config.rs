//! Configuration system for training jobs
//!
//! Each concern (saving, sampling, training, model, logging, critic) gets its
//! own typed struct, validated at construction. Defaults mirror the values a
//! fresh job starts from.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Job-level identity and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name, used for checkpoint file naming
    pub name: String,

    /// Root folder under which `{name}/` holds checkpoints and samples
    pub training_folder: PathBuf,

    /// Device identifier ("cpu", "cuda:0", "metal")
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "cpu".to_string()
}

impl JobConfig {
    /// Save root for this job: `{training_folder}/{name}`
    pub fn save_root(&self) -> PathBuf {
        self.training_folder.join(&self.name)
    }

    /// Resolve the configured device string
    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "metal" => Device::new_metal(0).map_err(Error::from),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .or_else(|| (other == "cuda").then_some("0"))
                    .ok_or_else(|| Error::config(format!("unknown device: {other}")))?;
                let ordinal: usize = ordinal
                    .parse()
                    .map_err(|_| Error::config(format!("bad device ordinal: {other}")))?;
                Device::new_cuda(ordinal).map_err(Error::from)
            }
        }
    }
}

/// Checkpoint persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Save an intermediate checkpoint every N steps (disabled when absent)
    #[serde(default)]
    pub save_every: Option<u64>,

    /// Intermediate checkpoints retained per job; older ones are pruned
    #[serde(default = "default_saves_to_keep")]
    pub max_step_saves_to_keep: usize,

    /// Serialization dtype tag attached to saves
    #[serde(default = "default_save_dtype")]
    pub dtype: String,
}

fn default_saves_to_keep() -> usize {
    5
}

fn default_save_dtype() -> String {
    "float16".to_string()
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            save_every: None,
            max_step_saves_to_keep: default_saves_to_keep(),
            dtype: default_save_dtype(),
        }
    }
}

/// Periodic sampling settings
///
/// A diffusion job samples from `prompts`; an autoencoder job reconstructs
/// `sample_sources` images. The unused family stays empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Sample every N steps (disabled when absent)
    #[serde(default)]
    pub sample_every: Option<u64>,

    /// Prompts to render (diffusion jobs)
    #[serde(default)]
    pub prompts: Vec<String>,

    /// Negative prompt shared by all renders
    #[serde(default)]
    pub neg: String,

    /// Source images to reconstruct (autoencoder jobs)
    #[serde(default)]
    pub sample_sources: Vec<PathBuf>,

    /// Base seed for generation
    #[serde(default)]
    pub seed: u64,

    /// Increment the seed per prompt index instead of reusing it
    #[serde(default)]
    pub walk_seed: bool,

    /// Output width in pixels
    #[serde(default = "default_sample_dim")]
    pub width: u32,

    /// Output height in pixels
    #[serde(default = "default_sample_dim")]
    pub height: u32,

    /// Classifier-free guidance scale
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,

    /// Guidance rescale factor
    #[serde(default)]
    pub guidance_rescale: f64,

    /// Inference steps per sample
    #[serde(default = "default_sample_steps")]
    pub sample_steps: u32,

    /// Adapter multiplier applied while sampling
    #[serde(default = "default_multiplier")]
    pub network_multiplier: f64,
}

fn default_sample_dim() -> u32 {
    512
}

fn default_guidance_scale() -> f64 {
    7.0
}

fn default_sample_steps() -> u32 {
    20
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sample_every: None,
            prompts: Vec::new(),
            neg: String::new(),
            sample_sources: Vec::new(),
            seed: 0,
            walk_seed: false,
            width: default_sample_dim(),
            height: default_sample_dim(),
            guidance_scale: default_guidance_scale(),
            guidance_rescale: 0.0,
            sample_steps: default_sample_steps(),
            network_multiplier: default_multiplier(),
        }
    }
}

/// Base model identification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path or hub id of the base model
    #[serde(default)]
    pub name_or_path: String,

    /// Base model is an SD 2.x variant
    #[serde(default)]
    pub is_v2: bool,

    /// Base model is an SDXL variant
    #[serde(default)]
    pub is_xl: bool,
}

impl ModelConfig {
    /// Version tag recorded in checkpoint metadata
    pub fn base_model_version(&self) -> &'static str {
        if self.is_v2 {
            "sd_2.1"
        } else if self.is_xl {
            "sdxl_1.0"
        } else {
            "sd_1.5"
        }
    }
}

/// LoRA-style adapter settings; absent means direct backbone fine-tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Linear (attention) rank
    pub linear: usize,

    /// Alpha for linear layers
    pub linear_alpha: f64,

    /// Optional convolution rank
    #[serde(default)]
    pub conv: Option<usize>,

    /// Alpha for convolution layers
    #[serde(default)]
    pub conv_alpha: Option<f64>,
}

/// Core training parameters for a diffusion job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Total gradient steps; the LR schedule horizon is always this value,
    /// resume only moves the counter's starting point
    pub steps: u64,

    /// Base learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Optimizer name ("adamw", "adam", "sgd")
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    /// Learning rate schedule name ("constant", "linear", "cosine")
    #[serde(default = "default_lr_scheduler")]
    pub lr_scheduler: String,

    /// Compute dtype tag handed to the model backend
    #[serde(default = "default_train_dtype")]
    pub dtype: String,

    /// Batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Train the denoising backbone
    #[serde(default = "default_true")]
    pub train_unet: bool,

    /// Train the text encoder
    #[serde(default)]
    pub train_text_encoder: bool,

    /// Enable gradient checkpointing on the backbone
    #[serde(default)]
    pub gradient_checkpointing: bool,

    /// Enable memory-efficient attention kernels
    #[serde(default)]
    pub memory_efficient_attention: bool,

    /// Skip the baseline sample normally taken before the first step
    #[serde(default)]
    pub skip_first_sample: bool,
}

fn default_lr() -> f64 {
    1e-6
}

fn default_optimizer() -> String {
    "adamw".to_string()
}

fn default_lr_scheduler() -> String {
    "constant".to_string()
}

fn default_train_dtype() -> String {
    "float16".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Scalar logging cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit scalar logs every N steps (disabled when absent)
    #[serde(default = "default_log_every")]
    pub log_every: Option<u64>,
}

fn default_log_every() -> Option<u64> {
    Some(100)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_every: default_log_every(),
        }
    }
}

/// Adversarial critic settings for the autoencoder trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    /// Critic learning rate
    #[serde(default = "default_critic_lr")]
    pub learning_rate: f64,

    /// Critic optimizer name
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    /// Critic update iterations per generator step
    #[serde(default = "default_critic_per_gen")]
    pub num_critic_per_gen: u64,

    /// Gradient penalty coefficient
    #[serde(default = "default_lambda_gp")]
    pub lambda_gp: f64,

    /// Generator step at which the critic contribution starts
    #[serde(default)]
    pub start_step: u64,

    /// Linear warmup length, in generator steps after `start_step`
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
}

fn default_critic_lr() -> f64 {
    1e-5
}

fn default_critic_per_gen() -> u64 {
    1
}

fn default_lambda_gp() -> f64 {
    10.0
}

fn default_warmup_steps() -> u64 {
    1000
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_critic_lr(),
            optimizer: default_optimizer(),
            num_critic_per_gen: default_critic_per_gen(),
            lambda_gp: default_lambda_gp(),
            start_step: 0,
            warmup_steps: default_warmup_steps(),
        }
    }
}

/// One image dataset entry for the autoencoder trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory of training images
    pub path: PathBuf,
}

/// Training parameters for an autoencoder job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaeTrainConfig {
    /// Path of the base autoencoder weights
    pub vae_path: PathBuf,

    /// Image datasets to train on
    pub datasets: Vec<DatasetConfig>,

    /// Epoch budget; reconciled against `max_steps` at startup
    #[serde(default)]
    pub epochs: Option<u64>,

    /// Step budget; reconciled against `epochs` at startup
    #[serde(default)]
    pub max_steps: Option<u64>,

    /// Square training resolution
    #[serde(default = "default_resolution")]
    pub resolution: u32,

    /// Batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base learning rate
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Optimizer name
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    /// Compute dtype tag
    #[serde(default = "default_vae_dtype")]
    pub dtype: String,

    /// Decoder blocks to train ("all", "mid_block", "up_blocks", "conv_out")
    #[serde(default = "default_blocks")]
    pub blocks_to_train: Vec<String>,

    /// Style loss weight; 0 disables the term
    #[serde(default)]
    pub style_weight: f64,

    /// Content loss weight; 0 disables the term
    #[serde(default)]
    pub content_weight: f64,

    /// KL-divergence weight; 0 disables the term
    #[serde(default)]
    pub kld_weight: f64,

    /// Reconstruction MSE weight; 0 disables the term
    #[serde(default = "default_unit_weight")]
    pub mse_weight: f64,

    /// Comparative total-variation weight; 0 disables the term
    #[serde(default = "default_unit_weight")]
    pub tv_weight: f64,

    /// Critic generator-loss weight
    #[serde(default = "default_unit_weight")]
    pub critic_weight: f64,

    /// Enable the adversarial critic sub-process
    #[serde(default)]
    pub use_critic: bool,

    /// Critic settings, applied when `use_critic` is set
    #[serde(default)]
    pub critic: CriticConfig,
}

fn default_resolution() -> u32 {
    256
}

fn default_vae_dtype() -> String {
    "float32".to_string()
}

fn default_blocks() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_unit_weight() -> f64 {
    1.0
}

/// Full configuration of a diffusion/LoRA fine-tuning job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionJobConfig {
    /// Job identity
    pub job: JobConfig,

    /// Base model identification
    #[serde(default)]
    pub model: ModelConfig,

    /// Adapter settings; absent trains the backbone directly
    #[serde(default)]
    pub network: Option<NetworkConfig>,

    /// Training parameters
    pub train: TrainConfig,

    /// Checkpointing settings
    #[serde(default)]
    pub save: SaveConfig,

    /// Steady-state sampling settings
    #[serde(default)]
    pub sample: SampleConfig,

    /// Distinct configuration for a one-off sample before any training
    #[serde(default)]
    pub first_sample: Option<SampleConfig>,

    /// Logging cadence
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DiffusionJobConfig {
    /// Materialize from a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate before any resource allocation
    pub fn validate(&self) -> Result<()> {
        if self.job.name.is_empty() {
            return Err(Error::config("job name must not be empty"));
        }
        if self.train.steps == 0 {
            return Err(Error::config("train.steps must be positive"));
        }
        if self.sample.sample_every.is_some() && self.sample.prompts.is_empty() {
            return Err(Error::config(
                "sample_every is specified but no prompts are configured",
            ));
        }
        Ok(())
    }
}

/// Full configuration of an autoencoder fine-tuning job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoencoderJobConfig {
    /// Job identity
    pub job: JobConfig,

    /// Training parameters
    pub train: VaeTrainConfig,

    /// Checkpointing settings
    #[serde(default)]
    pub save: SaveConfig,

    /// Sampling settings (image reconstruction pairs)
    #[serde(default)]
    pub sample: SampleConfig,

    /// Logging cadence
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AutoencoderJobConfig {
    /// Materialize from a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_yaml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate before any resource allocation
    pub fn validate(&self) -> Result<()> {
        if self.job.name.is_empty() {
            return Err(Error::config("job name must not be empty"));
        }
        if self.train.epochs.is_none() && self.train.max_steps.is_none() {
            return Err(Error::config("epochs or max_steps must be specified"));
        }
        if self.sample.sample_every.is_some() && self.sample.sample_sources.is_empty() {
            return Err(Error::config(
                "sample_every is specified but sample_sources is not",
            ));
        }
        if self.train.datasets.is_empty() {
            return Err(Error::config("at least one dataset must be configured"));
        }
        Ok(())
    }

    /// Reconcile the epoch and step budgets against the dataset length.
    ///
    /// Effective steps = min(max_steps, epochs * batches_per_epoch), with each
    /// bound ignored when unset; returns (steps, epochs).
    pub fn effective_budget(&self, batches_per_epoch: usize) -> Result<(u64, u64)> {
        if batches_per_epoch == 0 {
            return Err(Error::config("dataset produced no batches"));
        }
        let per_epoch = batches_per_epoch as u64;
        let (steps, epochs) = match (self.train.max_steps, self.train.epochs) {
            (Some(steps), Some(epochs)) => {
                let epochs = epochs.min(steps / per_epoch).max(1);
                (steps.min(epochs * per_epoch), epochs)
            }
            (Some(steps), None) => (steps, (steps / per_epoch).max(1)),
            (None, Some(epochs)) => (epochs * per_epoch, epochs),
            (None, None) => {
                return Err(Error::config("epochs or max_steps must be specified"))
            }
        };
        Ok((steps, epochs))
    }
}

/// Validate that every configured dataset path is a directory
pub fn check_dataset_dirs(datasets: &[DatasetConfig]) -> Result<()> {
    for ds in datasets {
        if !Path::new(&ds.path).is_dir() {
            return Err(Error::config(format!(
                "dataset path is not a directory: {}",
                ds.path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobConfig {
        JobConfig {
            name: "test_job".to_string(),
            training_folder: PathBuf::from("/tmp/out"),
            device: "cpu".to_string(),
        }
    }

    #[test]
    fn test_save_root() {
        assert_eq!(job().save_root(), PathBuf::from("/tmp/out/test_job"));
    }

    #[test]
    fn test_diffusion_validation_rejects_sampling_without_prompts() {
        let cfg = DiffusionJobConfig {
            job: job(),
            model: ModelConfig::default(),
            network: None,
            train: TrainConfig {
                steps: 10,
                lr: default_lr(),
                optimizer: default_optimizer(),
                lr_scheduler: default_lr_scheduler(),
                dtype: default_train_dtype(),
                batch_size: 1,
                train_unet: true,
                train_text_encoder: false,
                gradient_checkpointing: false,
                memory_efficient_attention: false,
                skip_first_sample: false,
            },
            save: SaveConfig::default(),
            sample: SampleConfig {
                sample_every: Some(100),
                ..SampleConfig::default()
            },
            first_sample: None,
            logging: LoggingConfig::default(),
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_autoencoder_requires_step_or_epoch_budget() {
        let yaml = r#"
job:
  name: vae_job
  training_folder: /tmp/out
train:
  vae_path: /models/vae.safetensors
  datasets:
    - path: /data/images
"#;
        let err = AutoencoderJobConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_autoencoder_yaml_roundtrip() {
        let yaml = r#"
job:
  name: vae_job
  training_folder: /tmp/out
train:
  vae_path: /models/vae.safetensors
  max_steps: 500
  mse_weight: 1.0
  tv_weight: 0.0
  datasets:
    - path: /data/images
save:
  save_every: 100
  max_step_saves_to_keep: 2
"#;
        let cfg = AutoencoderJobConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.train.max_steps, Some(500));
        assert_eq!(cfg.save.max_step_saves_to_keep, 2);
        assert_eq!(cfg.train.blocks_to_train, vec!["all".to_string()]);
    }

    #[test]
    fn test_effective_budget_reconciliation() {
        let yaml = r#"
job:
  name: vae_job
  training_folder: /tmp/out
train:
  vae_path: /models/vae.safetensors
  max_steps: 100
  epochs: 50
  datasets:
    - path: /data/images
"#;
        let cfg = AutoencoderJobConfig::from_yaml(yaml).unwrap();
        // 10 batches per epoch: the step budget caps epochs at 10.
        let (steps, epochs) = cfg.effective_budget(10).unwrap();
        assert_eq!(epochs, 10);
        assert_eq!(steps, 100);
        // 3 batches per epoch: the epoch budget caps steps.
        let (steps, epochs) = cfg.effective_budget(3).unwrap();
        assert_eq!(epochs, 33);
        assert_eq!(steps, 99);
        // step budget below one epoch still trains the requested steps
        let (steps, epochs) = cfg.effective_budget(200).unwrap();
        assert_eq!(epochs, 1);
        assert_eq!(steps, 100);
    }
}
