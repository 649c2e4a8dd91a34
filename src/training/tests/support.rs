//! Recording strategy shared by the loop tests

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use crate::training::controller::{LoopSettings, TrainStrategy};
use crate::training::metrics::{LossBreakdown, MetricSink};
use crate::training::schedule::Intervals;

static TRACING: Once = Once::new();

/// Route controller logs through the test harness, honoring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Everything the mock observed, inspected by the tests after `run`
#[derive(Debug, Default)]
pub struct Calls {
    pub train_steps: u64,
    pub samples: Vec<(Option<u64>, bool)>,
    pub saves: Vec<Option<u64>>,
    pub epoch_ends: Vec<u64>,
    pub epoch_sinks: Vec<bool>,
    pub loaded_weight_names: Vec<String>,
    pub optimizer_horizon: Option<(u64, u64)>,
    pub finalized: bool,
}

pub struct MockStrategy {
    calls: Rc<RefCell<Calls>>,
}

impl MockStrategy {
    pub fn new() -> (Self, Rc<RefCell<Calls>>) {
        init_tracing();
        let calls = Rc::new(RefCell::new(Calls::default()));
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl TrainStrategy for MockStrategy {
    type Batch = u32;

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn load_model(&mut self) -> Result<()> {
        Ok(())
    }

    fn prepare_trainable(&mut self) -> Result<()> {
        Ok(())
    }

    fn load_weights(&mut self, weights: HashMap<String, Tensor>) -> Result<()> {
        let mut names: Vec<String> = weights.keys().cloned().collect();
        names.sort();
        self.calls.borrow_mut().loaded_weight_names = names;
        Ok(())
    }

    fn build_optimizer(&mut self, total_steps: u64, start_step: u64) -> Result<()> {
        self.calls.borrow_mut().optimizer_horizon = Some((total_steps, start_step));
        Ok(())
    }

    fn train_step(&mut self, _batch: &u32) -> Result<LossBreakdown> {
        self.calls.borrow_mut().train_steps += 1;
        Ok(LossBreakdown::new(0.5))
    }

    fn learning_rate(&self) -> f64 {
        1e-4
    }

    fn collect_weights(&self) -> Result<HashMap<String, Tensor>> {
        let mut map = HashMap::new();
        map.insert(
            "mock.weight".to_string(),
            Tensor::zeros((2,), DType::F32, &Device::Cpu)?,
        );
        Ok(map)
    }

    fn on_saved(&mut self, step: Option<u64>, _metadata: &HashMap<String, String>) -> Result<()> {
        self.calls.borrow_mut().saves.push(step);
        Ok(())
    }

    fn sample(&mut self, step: Option<u64>, first: bool) -> Result<()> {
        self.calls.borrow_mut().samples.push((step, first));
        Ok(())
    }

    fn emit_logs(&mut self, _step: u64, _sink: &mut dyn MetricSink) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: u64,
        sink: Option<&mut (dyn MetricSink + '_)>,
    ) -> Result<()> {
        let mut calls = self.calls.borrow_mut();
        calls.epoch_ends.push(epoch);
        calls.epoch_sinks.push(sink.is_some());
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.calls.borrow_mut().finalized = true;
        Ok(())
    }
}

/// Loop settings with everything disabled except what a test turns on
pub fn settings(save_root: &Path, total_steps: u64) -> LoopSettings {
    LoopSettings {
        job_name: "test_job".to_string(),
        save_root: save_root.to_path_buf(),
        total_steps,
        intervals: Intervals::default(),
        has_first_sample: false,
        skip_first_sample: true,
        max_step_saves_to_keep: 5,
        base_model: None,
    }
}
