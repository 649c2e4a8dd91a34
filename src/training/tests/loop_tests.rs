use tempfile::TempDir;

use super::support::{settings, MockStrategy};
use crate::error::Error;
use crate::training::controller::TrainLoop;
use crate::training::data::VecSource;
use crate::training::metrics::JsonlSink;
use crate::training::state::Phase;

fn batches(n: usize) -> VecSource<u32> {
    VecSource::new((0..n as u32).collect())
}

#[test]
fn test_zero_step_budget_rejected() {
    let dir = TempDir::new().unwrap();
    let (strategy, _calls) = MockStrategy::new();
    let result = TrainLoop::new(settings(dir.path(), 0), strategy);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_full_run_saves_intermediate_and_final() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(dir.path(), 10);
    cfg.intervals.save = Some(5);
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(4)).unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.train_steps, 10);
    // one gated save at step 5, the unconditional final save, none at step 0
    assert_eq!(calls.saves, vec![Some(5), None]);
    assert!(dir.path().join("test_job_000000005.safetensors").exists());
    assert!(dir.path().join("test_job.safetensors").exists());
    assert!(!dir.path().join("test_job_000000000.safetensors").exists());
    assert!(calls.finalized);
    assert_eq!(train_loop.phase(), Phase::Done);
}

#[test]
fn test_sample_cadence_with_baseline_and_final() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(dir.path(), 7);
    cfg.intervals.sample = Some(3);
    cfg.skip_first_sample = false;
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(4)).unwrap();

    // baseline before step 0, gated at 3 and 6, final at 7
    assert_eq!(
        calls.borrow().samples,
        vec![(None, false), (Some(3), false), (Some(6), false), (Some(7), false)]
    );
}

#[test]
fn test_first_sample_renders_before_baseline() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(dir.path(), 1);
    cfg.has_first_sample = true;
    cfg.skip_first_sample = false;
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(1)).unwrap();

    // both pre-training renders happen, first-sample config first
    assert_eq!(
        calls.borrow().samples,
        vec![(None, true), (None, false), (Some(1), false)]
    );
}

#[test]
fn test_skip_first_sample_keeps_requested_first_render() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(dir.path(), 1);
    cfg.has_first_sample = true;
    cfg.skip_first_sample = true;
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(1)).unwrap();

    // skipping the baseline never suppresses the explicit first sample
    assert_eq!(
        calls.borrow().samples,
        vec![(None, true), (Some(1), false)]
    );
}

#[test]
fn test_epoch_wraps_on_short_dataset() {
    // 3 batches, 7 steps: two epochs close, a third ends partially done
    let dir = TempDir::new().unwrap();
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(settings(dir.path(), 7), strategy).unwrap();
    train_loop.run(batches(3)).unwrap();

    assert_eq!(calls.borrow().train_steps, 7);
    assert_eq!(calls.borrow().epoch_ends, vec![0, 1]);
    assert_eq!(train_loop.state().epoch, 2);
    assert_eq!(train_loop.state().step, 7);
}

#[test]
fn test_attached_sink_reaches_epoch_end() {
    let dir = TempDir::new().unwrap();
    let sink = JsonlSink::create(&dir.path().join("metrics.jsonl")).unwrap();
    let (strategy, calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(settings(dir.path(), 4), strategy)
        .unwrap()
        .with_sink(Box::new(sink));
    train_loop.run(batches(2)).unwrap();

    assert_eq!(calls.borrow().epoch_ends, vec![0]);
    assert_eq!(calls.borrow().epoch_sinks, vec![true]);
}

#[test]
fn test_epoch_end_without_sink() {
    let dir = TempDir::new().unwrap();
    let (strategy, calls) = MockStrategy::new();
    let mut train_loop = TrainLoop::new(settings(dir.path(), 4), strategy).unwrap();
    train_loop.run(batches(2)).unwrap();

    assert_eq!(calls.borrow().epoch_sinks, vec![false]);
}

#[test]
fn test_retention_keeps_newest_intermediates() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(dir.path(), 10);
    cfg.intervals.save = Some(2);
    cfg.max_step_saves_to_keep = 2;
    let (strategy, _calls) = MockStrategy::new();

    let mut train_loop = TrainLoop::new(cfg, strategy).unwrap();
    train_loop.run(batches(4)).unwrap();

    let intermediates: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("test_job_"))
        .collect();
    assert_eq!(intermediates.len(), 2);
    assert!(dir.path().join("test_job_000000008.safetensors").exists());
    assert!(dir.path().join("test_job.safetensors").exists());
    assert!(!dir.path().join("test_job_000000002.safetensors").exists());
}

#[test]
fn test_empty_source_is_config_error() {
    let dir = TempDir::new().unwrap();
    let (strategy, _calls) = MockStrategy::new();
    let mut train_loop = TrainLoop::new(settings(dir.path(), 5), strategy).unwrap();
    let err = train_loop.run(batches(0)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
