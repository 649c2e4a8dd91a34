use std::collections::HashMap;

use candle_core::Device;
use tempfile::TempDir;

use super::support::{settings, MockStrategy};
use crate::error::Error;
use crate::metadata::build_metadata;
use crate::training::checkpoints::{checkpoint_path, CheckpointStore};
use crate::training::controller::TrainLoop;
use crate::training::data::VecSource;
use crate::training::state::TrainingState;

fn batches(n: usize) -> VecSource<u32> {
    VecSource::new((0..n as u32).collect())
}

/// Drop a checkpoint into `dir` as if a previous run had saved at `step`
fn seed_checkpoint(dir: &std::path::Path, step: u64, epoch: u64) {
    let mut state = TrainingState::new();
    state.step = step;
    state.epoch = epoch;
    let metadata = build_metadata("test_job", &state, None);
    let store = CheckpointStore::new(Device::Cpu);
    let mut weights = HashMap::new();
    weights.insert(
        "mock.weight".to_string(),
        candle_core::Tensor::zeros((2,), candle_core::DType::F32, &Device::Cpu).unwrap(),
    );
    let path = checkpoint_path(dir, "", "test_job", Some(step));
    store.save(&weights, &metadata, &path).unwrap();
}

#[test]
fn test_resume_from_final_checkpoint_is_noop() {
    let dir = TempDir::new().unwrap();
    let (strategy, _calls) = MockStrategy::new();
    let mut first_run = TrainLoop::new(settings(dir.path(), 5), strategy).unwrap();
    first_run.run(batches(2)).unwrap();

    // the final checkpoint carries step 5; a second run has nothing to do
    let (strategy, calls) = MockStrategy::new();
    let mut second_run = TrainLoop::new(settings(dir.path(), 5), strategy).unwrap();
    second_run.run(batches(2)).unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.train_steps, 0);
    assert_eq!(calls.loaded_weight_names, vec!["mock.weight".to_string()]);
    // schedule horizon stays the full budget, only the start moves
    assert_eq!(calls.optimizer_horizon, Some((5, 5)));
    assert_eq!(second_run.state().step, 5);
}

#[test]
fn test_resume_midway_executes_remaining_steps() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(dir.path(), 4, 1);

    let mut cfg = settings(dir.path(), 10);
    cfg.intervals.save = Some(4);
    let (strategy, calls) = MockStrategy::new();
    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(3)).unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.train_steps, 6);
    // step 4 is the resume step, so only step 8 fires before the final save
    assert_eq!(calls.saves, vec![Some(8), None]);
    assert_eq!(calls.optimizer_horizon, Some((10, 4)));
    assert_eq!(train_loop.state().start_step, 4);
}

#[test]
fn test_resume_is_idempotent_across_restarts() {
    let dir = TempDir::new().unwrap();
    seed_checkpoint(dir.path(), 6, 0);

    for _ in 0..2 {
        let (strategy, calls) = MockStrategy::new();
        let mut train_loop = TrainLoop::new(settings(dir.path(), 6), strategy).unwrap();
        train_loop.run(batches(2)).unwrap();
        assert_eq!(calls.borrow().train_steps, 0);
        assert_eq!(train_loop.state().step, 6);
    }
}

#[test]
fn test_checkpoint_without_counters_restores_weights_only() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(Device::Cpu);
    let mut weights = HashMap::new();
    weights.insert(
        "mock.weight".to_string(),
        candle_core::Tensor::zeros((2,), candle_core::DType::F32, &Device::Cpu).unwrap(),
    );
    let path = checkpoint_path(dir.path(), "", "test_job", Some(3));
    store.save(&weights, &HashMap::new(), &path).unwrap();

    let (strategy, calls) = MockStrategy::new();
    let mut train_loop = TrainLoop::new(settings(dir.path(), 3), strategy).unwrap();
    train_loop.run(batches(2)).unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.loaded_weight_names, vec!["mock.weight".to_string()]);
    assert_eq!(calls.train_steps, 3);
    assert_eq!(calls.optimizer_horizon, Some((3, 0)));
}

#[test]
fn test_unreadable_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("test_job.safetensors"), b"trashed bytes").unwrap();

    let (strategy, _calls) = MockStrategy::new();
    let mut train_loop = TrainLoop::new(settings(dir.path(), 5), strategy).unwrap();
    let err = train_loop.run(batches(2)).unwrap_err();
    assert!(matches!(err, Error::Resume(_)));
}
