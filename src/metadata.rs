//! Checkpoint metadata handling
//!
//! Metadata is a flat string map carried in the safetensors header. It is
//! built fresh from current state at every save call; nothing holds a shared
//! mutable metadata dictionary between saves.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::training::state::TrainingState;

/// Header key under which the training counters are stored, JSON-encoded
pub const TRAINING_INFO_KEY: &str = "training_info";

/// Header key for the base model version tag
pub const BASE_MODEL_VERSION_KEY: &str = "ss_base_model_version";

/// Header key for the producing job's name
pub const OUTPUT_NAME_KEY: &str = "ss_output_name";

/// Counters persisted with every checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingInfo {
    /// Step counter at save time
    pub step: u64,

    /// Epoch counter at save time (autoencoder jobs; 0 otherwise)
    #[serde(default)]
    pub epoch: u64,
}

/// Build the metadata map for a save from current state.
///
/// `model` is present for diffusion jobs and contributes the base-model
/// identification tags; autoencoder checkpoints carry only the counters and
/// the job name.
pub fn build_metadata(
    job_name: &str,
    state: &TrainingState,
    model: Option<&ModelConfig>,
) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    let info = TrainingInfo {
        step: state.step,
        epoch: state.epoch,
    };
    // serde_json cannot fail on this struct
    if let Ok(encoded) = serde_json::to_string(&info) {
        meta.insert(TRAINING_INFO_KEY.to_string(), encoded);
    }
    if let Some(model) = model {
        meta.insert(
            BASE_MODEL_VERSION_KEY.to_string(),
            model.base_model_version().to_string(),
        );
        if model.is_v2 {
            meta.insert("ss_v2".to_string(), "true".to_string());
        }
    }
    meta.insert(OUTPUT_NAME_KEY.to_string(), job_name.to_string());
    meta
}

/// Parse the training counters out of a checkpoint's metadata, if present
pub fn parse_training_info(meta: &HashMap<String, String>) -> Option<TrainingInfo> {
    let raw = meta.get(TRAINING_INFO_KEY)?;
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let mut state = TrainingState::new();
        state.step = 1234;
        state.epoch = 7;
        let meta = build_metadata("test_job", &state, None);
        assert_eq!(meta.get(OUTPUT_NAME_KEY).unwrap(), "test_job");

        let info = parse_training_info(&meta).unwrap();
        assert_eq!(info.step, 1234);
        assert_eq!(info.epoch, 7);
    }

    #[test]
    fn test_base_model_tags() {
        let state = TrainingState::new();
        let model = ModelConfig {
            name_or_path: "sd-v2".to_string(),
            is_v2: true,
            is_xl: false,
        };
        let meta = build_metadata("job", &state, Some(&model));
        assert_eq!(meta.get(BASE_MODEL_VERSION_KEY).unwrap(), "sd_2.1");
        assert_eq!(meta.get("ss_v2").unwrap(), "true");
    }

    #[test]
    fn test_missing_training_info_is_none() {
        let meta = HashMap::new();
        assert!(parse_training_info(&meta).is_none());
    }
}
