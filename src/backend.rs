//! Collaborator interfaces consumed by the training orchestration
//!
//! The numeric model architectures (diffusion backbone, VAE, adapter, critic,
//! feature extractor) are opaque differentiable components behind these
//! traits; the orchestration only needs forward passes, parameter enumeration
//! and state serialization from them.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Tensor, Var};

use crate::config::ModelConfig;
use crate::training::sampler::SampleRequest;

/// Flags applied while loading a model backend
#[derive(Debug, Clone, Default)]
pub struct ModelLoadFlags {
    /// Compute dtype tag ("float16", "bfloat16", "float32")
    pub dtype: String,

    /// Enable memory-efficient attention kernels
    pub memory_efficient_attention: bool,

    /// Enable gradient checkpointing
    pub gradient_checkpointing: bool,
}

/// One training batch for a diffusion job
#[derive(Debug, Clone)]
pub struct DiffusionBatch {
    /// Encoded image latents
    pub latents: Tensor,

    /// Conditioning embeddings
    pub conditioning: Tensor,
}

/// One training batch for an autoencoder job
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// Pixel tensor in [-1, 1], shape (batch, channels, height, width)
    pub pixels: Tensor,
}

/// Diffusion model backend (backbone + text encoder + noise scheduler)
pub trait DiffusionBackend {
    /// Load the base model and apply precision/attention flags
    fn load(&mut self, model: &ModelConfig, flags: &ModelLoadFlags) -> Result<()>;

    /// Mark backbone and/or text-encoder parameters trainable
    fn set_trainable(&mut self, train_unet: bool, train_text_encoder: bool) -> Result<()>;

    /// Enumerate the currently trainable parameters
    fn trainable_vars(&self) -> Vec<Var>;

    /// One denoising loss evaluation over a batch; the loss formula is the
    /// backend's business
    fn denoise_loss(&mut self, batch: &DiffusionBatch) -> Result<Tensor>;

    /// Collect the trainable weights for checkpointing
    fn collect_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Load previously saved trainable weights
    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;

    /// Release large in-memory resources at the end of a run
    fn release(&mut self) -> Result<()>;
}

/// LoRA-style adapter injected into a frozen backbone
pub trait AdapterBackend {
    /// Attach the adapter layers to the backbone
    fn apply(&mut self) -> Result<()>;

    /// Enumerate the adapter's trainable parameters
    fn trainable_vars(&self) -> Vec<Var>;

    /// Current scaling multiplier
    fn multiplier(&self) -> f64;

    /// Set the scaling multiplier
    fn set_multiplier(&mut self, multiplier: f64);

    /// Collect the adapter weights for checkpointing
    fn collect_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Load previously saved adapter weights
    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;
}

/// Latent distribution emitted by a VAE encoder
#[derive(Debug, Clone)]
pub struct LatentDist {
    /// Distribution mean
    pub mu: Tensor,

    /// Distribution log-variance
    pub logvar: Tensor,

    /// Sampled latents
    pub latents: Tensor,
}

/// Autoencoder backend
pub trait VaeBackend {
    /// Load the base weights from disk
    fn load_base(&mut self, path: &std::path::Path) -> Result<()>;

    /// Mark the requested decoder blocks trainable
    fn set_trainable_blocks(&mut self, blocks: &[String]) -> Result<()>;

    /// Enumerate the currently trainable parameters
    fn trainable_vars(&self) -> Vec<Var>;

    /// Encode a pixel batch into a latent distribution
    fn encode(&self, pixels: &Tensor) -> Result<LatentDist>;

    /// Decode latents back to pixels
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Collect the full model weights for checkpointing
    fn collect_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Load previously saved weights
    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;

    /// Release large in-memory resources at the end of a run
    fn release(&mut self) -> Result<()>;
}

/// Per-layer activations from a frozen feature extractor
///
/// `style` and `content` hold one loss tensor per extractor layer; `pooled`
/// is the deepest pooled feature map, consumed by the adversarial critic.
#[derive(Debug, Clone)]
pub struct PerceptualMaps {
    /// Per-layer style loss tensors
    pub style: Vec<Tensor>,

    /// Per-layer content loss tensors
    pub content: Vec<Tensor>,

    /// Pooled feature batch, stacked [prediction; target] along dim 0
    pub pooled: Tensor,
}

/// Frozen feature extractor producing perceptual loss activations
pub trait PerceptualExtractor {
    /// Forward a stacked [prediction; target] pixel batch
    fn extract(&self, stacked: &Tensor) -> Result<PerceptualMaps>;
}

/// Critic network trained adversarially against the generator
pub trait CriticModel {
    /// Score a feature batch; higher means "more like a real target"
    fn forward(&self, features: &Tensor) -> Result<Tensor>;

    /// Enumerate the critic's trainable parameters
    fn trainable_vars(&self) -> Vec<Var>;

    /// Collect the critic weights for checkpointing
    fn collect_weights(&self) -> Result<HashMap<String, Tensor>>;

    /// Load previously saved critic weights
    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;
}

/// Renders sample requests to image files
pub trait SampleRenderer {
    /// Render every request to its output path
    fn render(&mut self, requests: &[SampleRequest]) -> Result<()>;
}
