//! Optimizer and learning rate schedule factories
//!
//! Optimizers wrap candle's implementations behind a small object-safe
//! trait so the trainers stay generic over the configured name. Schedules
//! are pure functions of the step index; resuming a run replays the same
//! curve because the horizon is always the full configured step count.

use candle_core::{Tensor, Var};
use candle_nn::optim::Optimizer as CandleOptimizer;
use candle_nn::{AdamW, ParamsAdamW, SGD};

use crate::error::{Error, Result};

/// Object-safe optimizer interface over the configured trainable set
pub trait Optim {
    fn name(&self) -> &'static str;

    /// Backprop `loss` and apply one update to the owned variables
    fn backward_step(&mut self, loss: &Tensor) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Adaptation coefficient for d-adaptation style optimizers. `None` for
    /// optimizers whose configured rate is already the applied rate.
    fn d_coefficient(&self) -> Option<f64> {
        None
    }
}

/// Learning rate actually applied this step: `d * lr` for adaptive
/// optimizers, the plain configured rate otherwise
pub fn effective_lr(optimizer: &dyn Optim) -> f64 {
    let lr = optimizer.learning_rate();
    optimizer.d_coefficient().map_or(lr, |d| d * lr)
}

struct AdamWOptim(AdamW);

impl Optim for AdamWOptim {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.0.backward_step(loss)?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.0.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.0.set_learning_rate(lr);
    }
}

struct SgdOptim(SGD);

impl Optim for SgdOptim {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.0.backward_step(loss)?;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.0.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.0.set_learning_rate(lr);
    }
}

/// Build an optimizer over `vars` from its configured name
pub fn create_optimizer(name: &str, vars: Vec<Var>, lr: f64) -> Result<Box<dyn Optim>> {
    match name.to_lowercase().as_str() {
        "adamw" | "adam" => {
            let params = ParamsAdamW {
                lr,
                ..Default::default()
            };
            Ok(Box::new(AdamWOptim(AdamW::new(vars, params)?)))
        }
        "sgd" => Ok(Box::new(SgdOptim(SGD::new(vars, lr)?))),
        other => Err(Error::config(format!("unknown optimizer: {other}"))),
    }
}

/// Learning rate as a pure function of the global step
pub trait LrSchedule {
    fn name(&self) -> &'static str;

    fn lr_at(&self, step: u64) -> f64;
}

pub struct ConstantLr {
    base_lr: f64,
}

impl LrSchedule for ConstantLr {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn lr_at(&self, _step: u64) -> f64 {
        self.base_lr
    }
}

pub struct LinearLr {
    base_lr: f64,
    min_lr: f64,
    total_steps: u64,
}

impl LrSchedule for LinearLr {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn lr_at(&self, step: u64) -> f64 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let progress = (step.min(self.total_steps) as f64) / self.total_steps as f64;
        self.base_lr + (self.min_lr - self.base_lr) * progress
    }
}

pub struct CosineLr {
    base_lr: f64,
    min_lr: f64,
    total_steps: u64,
}

impl LrSchedule for CosineLr {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn lr_at(&self, step: u64) -> f64 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let progress = (step.min(self.total_steps) as f64) / self.total_steps as f64;
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

/// Build a schedule from its configured name.
///
/// `total_steps` must be the full configured horizon even on resume so the
/// curve is identical to an uninterrupted run.
pub fn create_scheduler(
    name: &str,
    base_lr: f64,
    total_steps: u64,
    min_lr: f64,
) -> Result<Box<dyn LrSchedule>> {
    match name.to_lowercase().as_str() {
        "constant" => Ok(Box::new(ConstantLr { base_lr })),
        "linear" => Ok(Box::new(LinearLr {
            base_lr,
            min_lr,
            total_steps,
        })),
        "cosine" => Ok(Box::new(CosineLr {
            base_lr,
            min_lr,
            total_steps,
        })),
        other => Err(Error::config(format!("unknown lr scheduler: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn one_var() -> Vec<Var> {
        vec![Var::zeros((2,), candle_core::DType::F32, &Device::Cpu).unwrap()]
    }

    #[test]
    fn test_create_optimizer_names() {
        assert_eq!(create_optimizer("adamw", one_var(), 1e-4).unwrap().name(), "adamw");
        assert_eq!(create_optimizer("SGD", one_var(), 1e-4).unwrap().name(), "sgd");
        assert!(matches!(
            create_optimizer("lion", one_var(), 1e-4),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_effective_lr_plain_optimizer() {
        let opt = create_optimizer("adamw", one_var(), 1e-4).unwrap();
        assert_relative_eq!(effective_lr(opt.as_ref()), 1e-4);
    }

    #[test]
    fn test_effective_lr_adaptive_optimizer() {
        struct Adaptive;
        impl Optim for Adaptive {
            fn name(&self) -> &'static str {
                "adaptive"
            }
            fn backward_step(&mut self, _loss: &Tensor) -> Result<()> {
                Ok(())
            }
            fn learning_rate(&self) -> f64 {
                1.0
            }
            fn set_learning_rate(&mut self, _lr: f64) {}
            fn d_coefficient(&self) -> Option<f64> {
                Some(3.5e-5)
            }
        }
        assert_relative_eq!(effective_lr(&Adaptive), 3.5e-5);
    }

    #[test]
    fn test_linear_schedule_endpoints() {
        let sched = create_scheduler("linear", 1e-3, 100, 0.0).unwrap();
        assert_relative_eq!(sched.lr_at(0), 1e-3);
        assert_relative_eq!(sched.lr_at(50), 5e-4);
        assert_relative_eq!(sched.lr_at(100), 0.0);
        // past the horizon the rate stays clamped
        assert_relative_eq!(sched.lr_at(150), 0.0);
    }

    #[test]
    fn test_cosine_schedule_endpoints() {
        let sched = create_scheduler("cosine", 1e-3, 100, 1e-5).unwrap();
        assert_relative_eq!(sched.lr_at(0), 1e-3);
        assert_relative_eq!(sched.lr_at(100), 1e-5);
        let mid = sched.lr_at(50);
        assert!(mid < 1e-3 && mid > 1e-5);
    }

    #[test]
    fn test_resume_replays_same_curve() {
        // a resumed run evaluates the same function of the step index
        let fresh = create_scheduler("linear", 1e-3, 200, 0.0).unwrap();
        let resumed = create_scheduler("linear", 1e-3, 200, 0.0).unwrap();
        for step in [0u64, 73, 120, 199] {
            assert_relative_eq!(fresh.lr_at(step), resumed.lr_at(step));
        }
    }
}
