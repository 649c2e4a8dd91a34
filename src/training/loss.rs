//! Weighted reconstruction loss composition for autoencoder training
//!
//! Terms are gated on their configured weight: a zero weight means the term
//! is never evaluated, not evaluated and multiplied by zero, so optional
//! inputs (encoder distribution, perceptual maps) are only required when the
//! corresponding weight is positive. Perceptual terms are normalized by
//! calibration scalers measured once on noise, so each layer starts with a
//! comparable magnitude.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::backend::{LatentDist, PerceptualExtractor, PerceptualMaps};
use crate::config::VaeTrainConfig;
use crate::error::{Error, Result};
use crate::training::metrics::LossBreakdown;

/// Term weights lifted out of the job configuration
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub style: f64,
    pub content: f64,
    pub kld: f64,
    pub mse: f64,
    pub tv: f64,
    pub critic: f64,
}

impl From<&VaeTrainConfig> for LossWeights {
    fn from(cfg: &VaeTrainConfig) -> Self {
        Self {
            style: cfg.style_weight,
            content: cfg.content_weight,
            kld: cfg.kld_weight,
            mse: cfg.mse_weight,
            tv: cfg.tv_weight,
            critic: cfg.critic_weight,
        }
    }
}

/// Composes the total autoencoder training loss from its weighted terms
pub struct LossComposer {
    weights: LossWeights,
    style_scalers: Vec<f64>,
    content_scalers: Vec<f64>,
}

impl LossComposer {
    pub fn new(weights: LossWeights) -> Self {
        Self {
            weights,
            style_scalers: Vec::new(),
            content_scalers: Vec::new(),
        }
    }

    /// True when any perceptual term is active and needs extractor output
    pub fn needs_perceptual(&self) -> bool {
        self.weights.style > 0.0 || self.weights.content > 0.0
    }

    /// Measure per-layer normalization scalers on pure noise.
    ///
    /// Each scaler is the reciprocal of the layer's mean activation loss on
    /// a noise batch, bringing every layer to unit scale before weighting.
    /// Skipped when no perceptual term is active.
    pub fn calibrate(
        &mut self,
        extractor: &dyn PerceptualExtractor,
        resolution: u32,
        device: &candle_core::Device,
    ) -> Result<()> {
        if !self.needs_perceptual() {
            return Ok(());
        }
        let res = resolution as usize;
        let noise = Tensor::randn(0f32, 1f32, (2, 3, res, res), device)?;
        let maps = extractor.extract(&noise)?;
        self.style_scalers = reciprocal_means(&maps.style)?;
        self.content_scalers = reciprocal_means(&maps.content)?;
        debug!(
            style_layers = self.style_scalers.len(),
            content_layers = self.content_scalers.len(),
            "calibrated perceptual scalers"
        );
        Ok(())
    }

    /// Compose the weighted total for one step.
    ///
    /// `critic_gen` is the already-warmed generator loss from the critic;
    /// `latent` and `perceptual` may be `None` only when the terms needing
    /// them carry zero weight.
    pub fn compute(
        &self,
        pred: &Tensor,
        target: &Tensor,
        latent: Option<&LatentDist>,
        perceptual: Option<&PerceptualMaps>,
        critic_gen: Option<&Tensor>,
    ) -> Result<(Tensor, LossBreakdown)> {
        let mut total = Tensor::zeros((), pred.dtype(), pred.device())?;
        let mut breakdown = LossBreakdown::default();

        let style = if self.weights.style > 0.0 {
            let maps = require_perceptual(perceptual, "style_weight")?;
            scaled_layer_sum(&maps.style, &self.style_scalers)?
                .affine(self.weights.style, 0.0)?
        } else {
            Tensor::zeros((), pred.dtype(), pred.device())?
        };
        total = (&total + &style)?;
        breakdown = breakdown.with_term("style", scalar(&style)?);

        let content = if self.weights.content > 0.0 {
            let maps = require_perceptual(perceptual, "content_weight")?;
            scaled_layer_sum(&maps.content, &self.content_scalers)?
                .affine(self.weights.content, 0.0)?
        } else {
            Tensor::zeros((), pred.dtype(), pred.device())?
        };
        total = (&total + &content)?;
        breakdown = breakdown.with_term("content", scalar(&content)?);

        let kl = if self.weights.kld > 0.0 {
            let dist = latent.ok_or_else(|| {
                Error::config("kld_weight is set but no encoder distribution is available")
            })?;
            kl_divergence(dist)?.affine(self.weights.kld, 0.0)?
        } else {
            Tensor::zeros((), pred.dtype(), pred.device())?
        };
        total = (&total + &kl)?;
        breakdown = breakdown.with_term("kl", scalar(&kl)?);

        let mse = if self.weights.mse > 0.0 {
            (pred - target)?
                .sqr()?
                .mean_all()?
                .affine(self.weights.mse, 0.0)?
        } else {
            Tensor::zeros((), pred.dtype(), pred.device())?
        };
        total = (&total + &mse)?;
        breakdown = breakdown.with_term("mse", scalar(&mse)?);

        let tv = if self.weights.tv > 0.0 {
            comparative_tv(pred, target)?.affine(self.weights.tv, 0.0)?
        } else {
            Tensor::zeros((), pred.dtype(), pred.device())?
        };
        total = (&total + &tv)?;
        breakdown = breakdown.with_term("tv", scalar(&tv)?);

        if let Some(gen) = critic_gen {
            let weighted = gen.affine(self.weights.critic, 0.0)?;
            total = (&total + &weighted)?;
            breakdown = breakdown.with_term("crG", scalar(&weighted)?);
        }

        breakdown.total = scalar(&total)?;
        Ok((total, breakdown))
    }
}

fn require_perceptual<'a>(
    maps: Option<&'a PerceptualMaps>,
    weight_name: &str,
) -> Result<&'a PerceptualMaps> {
    maps.ok_or_else(|| {
        Error::config(format!(
            "{weight_name} is set but no perceptual maps are available"
        ))
    })
}

fn reciprocal_means(layers: &[Tensor]) -> Result<Vec<f64>> {
    layers
        .iter()
        .map(|layer| {
            let mean = scalar(&layer.mean_all()?)?;
            Ok(1.0 / mean)
        })
        .collect()
}

fn scaled_layer_sum(layers: &[Tensor], scalers: &[f64]) -> Result<Tensor> {
    if layers.is_empty() {
        return Err(Error::config("perceptual extractor produced no layers"));
    }
    if layers.len() != scalers.len() {
        return Err(Error::config(format!(
            "perceptual layer count changed after calibration: {} vs {}",
            layers.len(),
            scalers.len()
        )));
    }
    let mut sum = layers[0].mean_all()?.affine(scalers[0], 0.0)?;
    for (layer, scaler) in layers.iter().zip(scalers).skip(1) {
        sum = (&sum + &layer.mean_all()?.affine(*scaler, 0.0)?)?;
    }
    Ok(sum)
}

/// `-0.5 * sum(1 + logvar - mu^2 - e^logvar)` over the latent distribution
fn kl_divergence(dist: &LatentDist) -> Result<Tensor> {
    let inner = ((dist.logvar.affine(1.0, 1.0)? - dist.mu.sqr()?)? - dist.logvar.exp()?)?;
    Ok(inner.sum_all()?.affine(-0.5, 0.0)?)
}

fn total_variation(x: &Tensor) -> Result<Tensor> {
    let (_b, _c, h, w) = x.dims4()?;
    let dh = (x.narrow(2, 1, h - 1)? - x.narrow(2, 0, h - 1)?)?
        .abs()?
        .mean_all()?;
    let dw = (x.narrow(3, 1, w - 1)? - x.narrow(3, 0, w - 1)?)?
        .abs()?
        .mean_all()?;
    Ok((&dh + &dw)?)
}

/// Absolute difference between the total variation of prediction and target,
/// penalizing a change in overall smoothness rather than smoothness itself
fn comparative_tv(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((total_variation(pred)? - total_variation(target)?)?.abs()?)
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
