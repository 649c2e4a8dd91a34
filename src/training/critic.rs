//! Adversarial critic sub-process for autoencoder training
//!
//! The critic scores pooled perceptual features of reconstruction and
//! target; it trains with a WGAN gradient-penalty objective on its own
//! optimizer over its own checkpoint lineage (files prefixed `CRITIC_`),
//! stepping in lockstep with the generator but never sharing state with it.
//! Its contribution to the generator loss ramps in linearly after a
//! configured start step.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use tracing::info;

use crate::backend::CriticModel;
use crate::config::CriticConfig;
use crate::error::{Error, Result};
use crate::training::checkpoints::{checkpoint_path, CheckpointStore, CRITIC_PREFIX};
use crate::training::optimizers::{create_optimizer, create_scheduler, effective_lr, Optim};

pub struct Critic {
    model: Box<dyn CriticModel>,
    cfg: CriticConfig,
    optimizer: Option<Box<dyn Optim>>,
    device: Device,
}

impl Critic {
    pub fn new(model: Box<dyn CriticModel>, cfg: CriticConfig, device: Device) -> Self {
        Self {
            model,
            cfg,
            optimizer: None,
            device,
        }
    }

    /// Restore the latest critic checkpoint if one exists and build the
    /// optimizer. The schedule horizon covers every critic iteration of the
    /// full run so a resumed critic sees the same curve.
    pub fn setup(
        &mut self,
        job_name: &str,
        save_root: &Path,
        total_gen_steps: u64,
        store: &CheckpointStore,
    ) -> Result<()> {
        if let Some(path) = store.find_latest(job_name, save_root, CRITIC_PREFIX) {
            let (weights, _meta) = store.load(&path)?;
            self.model.load_weights(weights)?;
            info!(path = %path.display(), "restored critic checkpoint");
        }
        let vars = self.model.trainable_vars();
        let mut optimizer = create_optimizer(&self.cfg.optimizer, vars, self.cfg.learning_rate)?;
        let horizon = total_gen_steps * self.cfg.num_critic_per_gen;
        let schedule = create_scheduler("constant", self.cfg.learning_rate, horizon, 0.0)?;
        optimizer.set_learning_rate(schedule.lr_at(0));
        self.optimizer = Some(optimizer);
        Ok(())
    }

    /// Save the critic alongside a generator checkpoint, under the same
    /// step suffix but with the `CRITIC_` filename prefix
    pub fn save(
        &self,
        store: &CheckpointStore,
        save_root: &Path,
        job_name: &str,
        step: Option<u64>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let path = checkpoint_path(save_root, CRITIC_PREFIX, job_name, step);
        store.save(&self.model.collect_weights()?, metadata, &path)
    }

    /// Applied critic learning rate, for progress reporting
    pub fn learning_rate(&self) -> f64 {
        self.optimizer
            .as_ref()
            .map(|o| effective_lr(o.as_ref()))
            .unwrap_or(self.cfg.learning_rate)
    }

    /// One generator step's worth of critic updates.
    ///
    /// `features` is the pooled extractor output stacked [prediction;
    /// target] along dim 0; it is detached so critic updates never reach
    /// the generator. Returns the mean critic loss over the inner
    /// iterations.
    pub fn discriminator_step(&mut self, features: &Tensor) -> Result<f64> {
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| Error::config("critic stepped before setup"))?;
        let features = features.detach();
        let halves = features.chunk(2, 0)?;
        let (pred, target) = (&halves[0], &halves[1]);

        let iterations = self.cfg.num_critic_per_gen.max(1);
        let mut loss_sum = 0.0;
        for _ in 0..iterations {
            let pred_score = self.model.forward(pred)?.mean_all()?;
            let target_score = self.model.forward(target)?.mean_all()?;
            let penalty = gradient_penalty(self.model.as_ref(), pred, target)?;
            let loss =
                ((pred_score - target_score)? + penalty.affine(self.cfg.lambda_gp, 0.0)?)?;
            optimizer.backward_step(&loss)?;
            loss_sum += scalar(&loss)?;
        }
        Ok(loss_sum / iterations as f64)
    }

    /// Critic contribution to the generator loss at `step`.
    ///
    /// Zero before `start_step`, then the raw `-mean(score(prediction))`
    /// scaled by `(step - start_step) / warmup_steps` clamped to 1.
    pub fn generator_loss(&self, features: &Tensor, step: u64) -> Result<Tensor> {
        if step < self.cfg.start_step {
            return Ok(Tensor::zeros((), DType::F32, &self.device)?);
        }
        let warmup = if self.cfg.warmup_steps == 0 {
            1.0
        } else {
            (((step - self.cfg.start_step) as f64) / self.cfg.warmup_steps as f64).min(1.0)
        };
        let halves = features.chunk(2, 0)?;
        let pred_score = self.model.forward(&halves[0])?.mean_all()?;
        Ok(pred_score.neg()?.affine(warmup, 0.0)?)
    }
}

/// WGAN-GP penalty: `(||d score/d x|| - 1)^2` at a random interpolation of
/// prediction and target features
fn gradient_penalty(model: &dyn CriticModel, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let eps = Tensor::rand(0f32, 1f32, (), pred.device())?;
    let interpolated =
        (pred.broadcast_mul(&eps)? + target.broadcast_mul(&eps.affine(-1.0, 1.0)?)?)?;
    let probe = Var::from_tensor(&interpolated.detach())?;
    let score = model.forward(probe.as_tensor())?.sum_all()?;
    let grads = score.backward()?;
    let grad = grads.get(&probe).ok_or_else(|| {
        Error::Other(anyhow::anyhow!(
            "critic produced no gradient for the interpolated batch"
        ))
    })?;
    let norm = grad.sqr()?.sum_all()?.sqrt()?;
    Ok(norm.affine(1.0, -1.0)?.sqr()?)
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
