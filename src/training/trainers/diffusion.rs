//! Diffusion fine-tuning strategy
//!
//! Trains either a LoRA-style adapter over a frozen backbone or the
//! backbone itself, depending on whether a network section is configured.
//! The denoising loss formula belongs to the model backend; this strategy
//! owns parameter selection, the optimizer and schedule, prompt sampling
//! and the loss window for progress logs.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::backend::{
    AdapterBackend, DiffusionBackend, DiffusionBatch, ModelLoadFlags, SampleRenderer,
};
use crate::config::DiffusionJobConfig;
use crate::error::{Error, Result};
use crate::training::controller::{LoopSettings, TrainStrategy};
use crate::training::metrics::{LossAccumulator, LossBreakdown, MetricSink};
use crate::training::optimizers::{
    create_optimizer, create_scheduler, effective_lr, LrSchedule, Optim,
};
use crate::training::sampler::build_prompt_requests;
use crate::training::schedule::Intervals;

pub struct DiffusionTrainer {
    cfg: DiffusionJobConfig,
    device: Device,
    backend: Box<dyn DiffusionBackend>,
    adapter: Option<Box<dyn AdapterBackend>>,
    renderer: Box<dyn SampleRenderer>,
    optimizer: Option<Box<dyn Optim>>,
    schedule: Option<Box<dyn LrSchedule>>,
    steps_done: u64,
    window: LossAccumulator,
}

impl DiffusionTrainer {
    /// `adapter` must be present exactly when the configuration carries a
    /// network section
    pub fn new(
        cfg: DiffusionJobConfig,
        backend: Box<dyn DiffusionBackend>,
        adapter: Option<Box<dyn AdapterBackend>>,
        renderer: Box<dyn SampleRenderer>,
    ) -> Result<Self> {
        if cfg.network.is_some() != adapter.is_some() {
            return Err(Error::config(
                "network configuration and adapter backend must be provided together",
            ));
        }
        let device = cfg.job.device()?;
        Ok(Self {
            cfg,
            device,
            backend,
            adapter,
            renderer,
            optimizer: None,
            schedule: None,
            steps_done: 0,
            window: LossAccumulator::new(),
        })
    }

    /// Loop settings derived from the job configuration
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            job_name: self.cfg.job.name.clone(),
            save_root: self.cfg.job.save_root(),
            total_steps: self.cfg.train.steps,
            intervals: Intervals {
                sample: self.cfg.sample.sample_every,
                save: self.cfg.save.save_every,
                log: self.cfg.logging.log_every,
            },
            has_first_sample: self.cfg.first_sample.is_some(),
            skip_first_sample: self.cfg.train.skip_first_sample,
            max_step_saves_to_keep: self.cfg.save.max_step_saves_to_keep,
            base_model: Some(self.cfg.model.clone()),
        }
    }

    fn optimizer_mut(&mut self) -> Result<&mut Box<dyn Optim>> {
        self.optimizer
            .as_mut()
            .ok_or_else(|| Error::config("training step before optimizer setup"))
    }
}

impl TrainStrategy for DiffusionTrainer {
    type Batch = DiffusionBatch;

    fn device(&self) -> Device {
        self.device.clone()
    }

    fn load_model(&mut self) -> Result<()> {
        let flags = ModelLoadFlags {
            dtype: self.cfg.train.dtype.clone(),
            memory_efficient_attention: self.cfg.train.memory_efficient_attention,
            gradient_checkpointing: self.cfg.train.gradient_checkpointing,
        };
        self.backend.load(&self.cfg.model, &flags)?;
        Ok(())
    }

    fn prepare_trainable(&mut self) -> Result<()> {
        match self.adapter.as_mut() {
            Some(adapter) => {
                adapter.apply()?;
                adapter.set_multiplier(1.0);
                info!(params = adapter.trainable_vars().len(), "adapter attached");
            }
            None => {
                self.backend
                    .set_trainable(self.cfg.train.train_unet, self.cfg.train.train_text_encoder)?;
                info!(
                    params = self.backend.trainable_vars().len(),
                    "backbone parameters selected"
                );
            }
        }
        Ok(())
    }

    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()> {
        match self.adapter.as_mut() {
            Some(adapter) => {
                adapter.load_weights(weights)?;
                // saved adapters may carry a scaled multiplier
                adapter.set_multiplier(1.0);
            }
            None => self.backend.load_weights(weights)?,
        }
        Ok(())
    }

    fn build_optimizer(&mut self, total_steps: u64, start_step: u64) -> Result<()> {
        let vars = match self.adapter.as_ref() {
            Some(adapter) => adapter.trainable_vars(),
            None => self.backend.trainable_vars(),
        };
        if vars.is_empty() {
            return Err(Error::config("no trainable parameters selected"));
        }
        let mut optimizer =
            create_optimizer(&self.cfg.train.optimizer, vars, self.cfg.train.lr)?;
        let schedule = create_scheduler(
            &self.cfg.train.lr_scheduler,
            self.cfg.train.lr,
            total_steps,
            0.0,
        )?;
        optimizer.set_learning_rate(schedule.lr_at(start_step));
        self.optimizer = Some(optimizer);
        self.schedule = Some(schedule);
        self.steps_done = start_step;
        Ok(())
    }

    fn train_step(&mut self, batch: &DiffusionBatch) -> Result<LossBreakdown> {
        let lr = self
            .schedule
            .as_ref()
            .map(|s| s.lr_at(self.steps_done))
            .unwrap_or(self.cfg.train.lr);
        let loss = self.backend.denoise_loss(batch)?;
        let optimizer = self.optimizer_mut()?;
        optimizer.set_learning_rate(lr);
        optimizer.backward_step(&loss)?;
        self.steps_done += 1;

        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let breakdown = LossBreakdown::new(value);
        self.window.record(&breakdown);
        Ok(breakdown)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer
            .as_ref()
            .map(|o| effective_lr(o.as_ref()))
            .unwrap_or(self.cfg.train.lr)
    }

    fn collect_weights(&self) -> Result<HashMap<String, Tensor>> {
        let weights = match self.adapter.as_ref() {
            Some(adapter) => adapter.collect_weights()?,
            None => self.backend.collect_weights()?,
        };
        Ok(weights)
    }

    fn on_saved(&mut self, _step: Option<u64>, _metadata: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn sample(&mut self, step: Option<u64>, first: bool) -> Result<()> {
        let sample_cfg = match (first, self.cfg.first_sample.as_ref()) {
            (true, Some(first_cfg)) => first_cfg,
            _ => &self.cfg.sample,
        };
        if sample_cfg.prompts.is_empty() {
            return Ok(());
        }
        let requests =
            build_prompt_requests(sample_cfg, &self.cfg.job.save_root(), step);
        self.renderer.render(&requests)?;
        Ok(())
    }

    fn emit_logs(&mut self, step: u64, sink: &mut dyn MetricSink) -> Result<()> {
        for (name, value) in self.window.means() {
            sink.scalar(&name, value, step)?;
        }
        self.window.reset();
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _epoch: u64,
        _sink: Option<&mut (dyn MetricSink + '_)>,
    ) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.backend.release()?;
        Ok(())
    }
}
