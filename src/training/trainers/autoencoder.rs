//! Autoencoder fine-tuning strategy
//!
//! Reconstructs pixel batches through the VAE and optimizes the weighted
//! loss composition, optionally against an adversarial critic. The critic
//! runs entirely inside this strategy: it steps on detached features before
//! each generator update and saves its own `CRITIC_` checkpoint whenever
//! the generator saves.
//!
//! Two loss windows advance independently: the log window resets at every
//! progress log, the epoch window only at epoch boundaries, so a mid-epoch
//! log never skews the epoch summary.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use tracing::info;

use crate::backend::{
    CriticModel, ImageBatch, PerceptualExtractor, PerceptualMaps, SampleRenderer, VaeBackend,
};
use crate::config::{check_dataset_dirs, AutoencoderJobConfig};
use crate::error::{Error, Result};
use crate::training::checkpoints::CheckpointStore;
use crate::training::controller::{LoopSettings, TrainStrategy};
use crate::training::critic::Critic;
use crate::training::loss::{LossComposer, LossWeights};
use crate::training::metrics::{LossAccumulator, LossBreakdown, MetricSink};
use crate::training::optimizers::{create_optimizer, effective_lr, Optim};
use crate::training::sampler::build_image_requests;
use crate::training::schedule::Intervals;

pub struct AutoencoderTrainer {
    cfg: AutoencoderJobConfig,
    device: Device,
    vae: Box<dyn VaeBackend>,
    extractor: Option<Box<dyn PerceptualExtractor>>,
    renderer: Box<dyn SampleRenderer>,
    composer: LossComposer,
    critic: Option<Critic>,
    store: CheckpointStore,
    optimizer: Option<Box<dyn Optim>>,
    steps_done: u64,
    log_window: LossAccumulator,
    epoch_window: LossAccumulator,
}

impl AutoencoderTrainer {
    /// `extractor` is required when any perceptual weight is positive or the
    /// critic is enabled; `critic_model` exactly when the critic is enabled.
    pub fn new(
        cfg: AutoencoderJobConfig,
        vae: Box<dyn VaeBackend>,
        extractor: Option<Box<dyn PerceptualExtractor>>,
        critic_model: Option<Box<dyn CriticModel>>,
        renderer: Box<dyn SampleRenderer>,
    ) -> Result<Self> {
        check_dataset_dirs(&cfg.train.datasets)?;
        let device = cfg.job.device()?;
        let composer = LossComposer::new(LossWeights::from(&cfg.train));
        if composer.needs_perceptual() && extractor.is_none() {
            return Err(Error::config(
                "style or content weight is set but no feature extractor is available",
            ));
        }
        if cfg.train.use_critic != critic_model.is_some() {
            return Err(Error::config(
                "use_critic and the critic model must be provided together",
            ));
        }
        if cfg.train.use_critic && extractor.is_none() {
            return Err(Error::config(
                "the critic scores extractor features, a feature extractor is required",
            ));
        }
        let critic = critic_model
            .map(|model| Critic::new(model, cfg.train.critic.clone(), device.clone()));
        let store = CheckpointStore::new(device.clone());
        Ok(Self {
            cfg,
            device,
            vae,
            extractor,
            renderer,
            composer,
            critic,
            store,
            optimizer: None,
            steps_done: 0,
            log_window: LossAccumulator::new(),
            epoch_window: LossAccumulator::new(),
        })
    }

    /// Loop settings for an already reconciled step budget
    pub fn loop_settings(&self, total_steps: u64) -> LoopSettings {
        LoopSettings {
            job_name: self.cfg.job.name.clone(),
            save_root: self.cfg.job.save_root(),
            total_steps,
            intervals: Intervals {
                sample: self.cfg.sample.sample_every,
                save: self.cfg.save.save_every,
                log: self.cfg.logging.log_every,
            },
            has_first_sample: false,
            skip_first_sample: false,
            max_step_saves_to_keep: self.cfg.save.max_step_saves_to_keep,
            base_model: None,
        }
    }

    /// Reconcile the configured epoch/step budgets against a dataset length
    pub fn effective_budget(&self, batches_per_epoch: usize) -> Result<(u64, u64)> {
        self.cfg.effective_budget(batches_per_epoch)
    }

    fn extract(&self, pred: &Tensor, target: &Tensor) -> Result<Option<PerceptualMaps>> {
        let Some(extractor) = self.extractor.as_ref() else {
            return Ok(None);
        };
        // extractor expects pixels in [0, 1]
        let stacked = Tensor::cat(&[pred, target], 0)?
            .affine(0.5, 0.5)?
            .clamp(0.0, 1.0)?;
        Ok(Some(extractor.extract(&stacked)?))
    }
}

impl TrainStrategy for AutoencoderTrainer {
    type Batch = ImageBatch;

    fn device(&self) -> Device {
        self.device.clone()
    }

    fn load_model(&mut self) -> Result<()> {
        self.vae.load_base(&self.cfg.train.vae_path)?;
        if let Some(extractor) = self.extractor.as_ref() {
            self.composer
                .calibrate(extractor.as_ref(), self.cfg.train.resolution, &self.device)?;
        }
        Ok(())
    }

    fn prepare_trainable(&mut self) -> Result<()> {
        self.vae
            .set_trainable_blocks(&self.cfg.train.blocks_to_train)?;
        info!(
            params = self.vae.trainable_vars().len(),
            blocks = ?self.cfg.train.blocks_to_train,
            "decoder blocks selected"
        );
        Ok(())
    }

    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()> {
        self.vae.load_weights(weights)?;
        Ok(())
    }

    fn build_optimizer(&mut self, total_steps: u64, start_step: u64) -> Result<()> {
        let vars = self.vae.trainable_vars();
        if vars.is_empty() {
            return Err(Error::config("no trainable decoder blocks selected"));
        }
        self.optimizer = Some(create_optimizer(
            &self.cfg.train.optimizer,
            vars,
            self.cfg.train.learning_rate,
        )?);
        self.steps_done = start_step;
        if let Some(critic) = self.critic.as_mut() {
            critic.setup(
                &self.cfg.job.name,
                &self.cfg.job.save_root(),
                total_steps,
                &self.store,
            )?;
        }
        Ok(())
    }

    fn train_step(&mut self, batch: &ImageBatch) -> Result<LossBreakdown> {
        let step = self.steps_done;
        let latent = self.vae.encode(&batch.pixels)?;
        let pred = self.vae.decode(&latent.latents)?;
        let target = &batch.pixels;

        let maps = self.extract(&pred, target)?;
        let critic_result = match self.critic.as_mut() {
            Some(critic) => {
                let maps = maps.as_ref().ok_or_else(|| {
                    Error::config("critic enabled but no extractor features were produced")
                })?;
                let d_loss = critic.discriminator_step(&maps.pooled)?;
                let gen = critic.generator_loss(&maps.pooled, step)?;
                Some((gen, d_loss))
            }
            None => None,
        };

        let (total, mut breakdown) = self.composer.compute(
            &pred,
            target,
            Some(&latent),
            maps.as_ref(),
            critic_result.as_ref().map(|(gen, _)| gen),
        )?;
        if let Some((_, d_loss)) = critic_result {
            breakdown = breakdown.with_term("crD", d_loss);
        }

        self.optimizer
            .as_mut()
            .ok_or_else(|| Error::config("training step before optimizer setup"))?
            .backward_step(&total)?;
        self.steps_done += 1;

        self.log_window.record(&breakdown);
        self.epoch_window.record(&breakdown);
        Ok(breakdown)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer
            .as_ref()
            .map(|o| effective_lr(o.as_ref()))
            .unwrap_or(self.cfg.train.learning_rate)
    }

    fn collect_weights(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self.vae.collect_weights()?)
    }

    fn on_saved(&mut self, step: Option<u64>, metadata: &HashMap<String, String>) -> Result<()> {
        if let Some(critic) = self.critic.as_ref() {
            critic.save(
                &self.store,
                &self.cfg.job.save_root(),
                &self.cfg.job.name,
                step,
                metadata,
            )?;
        }
        Ok(())
    }

    fn sample(&mut self, step: Option<u64>, _first: bool) -> Result<()> {
        if self.cfg.sample.sample_sources.is_empty() {
            return Ok(());
        }
        let requests = build_image_requests(
            &self.cfg.sample,
            &self.cfg.sample.sample_sources,
            &self.cfg.job.save_root(),
            step,
        );
        self.renderer.render(&requests)?;
        Ok(())
    }

    fn emit_logs(&mut self, step: u64, sink: &mut dyn MetricSink) -> Result<()> {
        for (name, value) in self.log_window.means() {
            sink.scalar(&format!("loss/{name}"), value, step)?;
        }
        if let Some(critic) = self.critic.as_ref() {
            sink.scalar("lr/critic", critic.learning_rate(), step)?;
        }
        self.log_window.reset();
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: u64,
        sink: Option<&mut (dyn MetricSink + '_)>,
    ) -> Result<()> {
        if self.epoch_window.is_empty() {
            return Ok(());
        }
        let means = self.epoch_window.means();
        if let Some(sink) = sink {
            for (name, value) in &means {
                sink.scalar(&format!("epoch_loss/{name}"), *value, self.steps_done)?;
            }
        }
        if let Some((_, mean_total)) = means.iter().find(|(name, _)| name.as_str() == "loss") {
            info!(epoch, loss = mean_total, "epoch complete");
        }
        self.epoch_window.reset();
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.vae.release()?;
        Ok(())
    }
}
