//! Preview sample requests and output naming
//!
//! The loop builds declarative [`SampleRequest`]s and hands them to a
//! [`SampleRenderer`](crate::backend::SampleRenderer); file naming and seed
//! derivation live here so every trainer produces the same layout under
//! `save_root/samples`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::SampleConfig;

/// One preview image to render
#[derive(Debug, Clone)]
pub struct SampleRequest {
    /// Text prompt for generative sampling, `None` for reconstruction
    pub prompt: Option<String>,
    pub negative_prompt: String,
    /// Source image for reconstruction sampling, `None` for generative
    pub image_source: Option<PathBuf>,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f64,
    pub guidance_rescale: f64,
    pub num_inference_steps: u32,
    pub network_multiplier: f64,
    pub output_path: PathBuf,
}

/// Output file name: `{timestamp}[_{step:09}]_{index:02}.png`.
///
/// Baseline samples taken before any training carry no step segment.
pub fn sample_file_name(timestamp: &str, step: Option<u64>, index: usize) -> String {
    match step {
        Some(step) => format!("{timestamp}_{step:09}_{index:02}.png"),
        None => format!("{timestamp}_{index:02}.png"),
    }
}

fn samples_dir(save_root: &Path) -> PathBuf {
    save_root.join("samples")
}

fn timestamp_now() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Build one request per configured prompt.
///
/// With `walk_seed` enabled each prompt uses `seed + index` so a fixed grid
/// of previews stays comparable across runs; otherwise every prompt shares
/// the configured seed.
pub fn build_prompt_requests(
    cfg: &SampleConfig,
    save_root: &Path,
    step: Option<u64>,
) -> Vec<SampleRequest> {
    let dir = samples_dir(save_root);
    let timestamp = timestamp_now();
    cfg.prompts
        .iter()
        .enumerate()
        .map(|(index, prompt)| {
            let seed = if cfg.walk_seed {
                cfg.seed + index as u64
            } else {
                cfg.seed
            };
            SampleRequest {
                prompt: Some(prompt.clone()),
                negative_prompt: cfg.neg.clone(),
                image_source: None,
                seed,
                width: cfg.width,
                height: cfg.height,
                guidance_scale: cfg.guidance_scale,
                guidance_rescale: cfg.guidance_rescale,
                num_inference_steps: cfg.sample_steps,
                network_multiplier: cfg.network_multiplier,
                output_path: dir.join(sample_file_name(&timestamp, step, index)),
            }
        })
        .collect()
}

/// Build one reconstruction request per source image
pub fn build_image_requests(
    cfg: &SampleConfig,
    sources: &[PathBuf],
    save_root: &Path,
    step: Option<u64>,
) -> Vec<SampleRequest> {
    let dir = samples_dir(save_root);
    let timestamp = timestamp_now();
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| SampleRequest {
            prompt: None,
            negative_prompt: String::new(),
            image_source: Some(source.clone()),
            seed: cfg.seed,
            width: cfg.width,
            height: cfg.height,
            guidance_scale: cfg.guidance_scale,
            guidance_rescale: cfg.guidance_rescale,
            num_inference_steps: cfg.sample_steps,
            network_multiplier: cfg.network_multiplier,
            output_path: dir.join(sample_file_name(&timestamp, step, index)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cfg() -> SampleConfig {
        let mut cfg = SampleConfig::default();
        cfg.prompts = vec!["a cat".to_string(), "a dog".to_string(), "a bird".to_string()];
        cfg.seed = 42;
        cfg.walk_seed = true;
        cfg
    }

    #[test]
    fn test_sample_file_name_format() {
        assert_eq!(
            sample_file_name("20260830-120000", Some(1500), 2),
            "20260830-120000_000001500_02.png"
        );
        assert_eq!(
            sample_file_name("20260830-120000", None, 0),
            "20260830-120000_00.png"
        );
    }

    #[test]
    fn test_walk_seed_offsets_per_prompt() {
        let requests = build_prompt_requests(&sample_cfg(), Path::new("/out/job"), Some(10));
        let seeds: Vec<u64> = requests.iter().map(|r| r.seed).collect();
        assert_eq!(seeds, vec![42, 43, 44]);
    }

    #[test]
    fn test_fixed_seed_without_walk() {
        let mut cfg = sample_cfg();
        cfg.walk_seed = false;
        let requests = build_prompt_requests(&cfg, Path::new("/out/job"), Some(10));
        assert!(requests.iter().all(|r| r.seed == 42));
    }

    #[test]
    fn test_requests_land_under_samples_dir() {
        let requests = build_prompt_requests(&sample_cfg(), Path::new("/out/job"), None);
        for request in &requests {
            assert!(request.output_path.starts_with("/out/job/samples"));
        }
        // indices keep outputs from one batch distinct
        assert!(requests[0].output_path != requests[1].output_path);
    }
}
