use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::UserConfigError;
use crate::model_registry::{ModelEntry, ModelRegistry};

/// Parameter names understood by the pipeline stages.
pub mod keys {
    pub const MODEL: &str = "model";
    pub const PROMPT: &str = "prompt";
    pub const NEGATIVE_PROMPT: &str = "negative_prompt";
    pub const SEED: &str = "seed";
    pub const STEPS: &str = "steps";
    pub const CFG_SCALE: &str = "cfg_scale";
    pub const SAMPLER: &str = "sampler";
    pub const SCHEDULER: &str = "scheduler";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const INIT_IMAGE: &str = "init_image";
    pub const INIT_IMAGE_CREATIVITY: &str = "init_image_creativity";
    pub const OUTPUT_INTERMEDIATE_IMAGES: &str = "output_intermediate_images";

    pub const REFINER_METHOD: &str = "refiner_method";
    pub const REFINER_CONTROL: &str = "refiner_control";
    pub const REFINER_UPSCALE: &str = "refiner_upscale";
    pub const REFINER_UPSCALE_METHOD: &str = "refiner_upscale_method";
    pub const REFINER_MODEL: &str = "refiner_model";
    pub const REFINER_VAE: &str = "refiner_vae";
    pub const REFINER_STEPS: &str = "refiner_steps";
    pub const REFINER_CFG_SCALE: &str = "refiner_cfg_scale";
    pub const REFINER_DO_TILING: &str = "refiner_do_tiling";
    pub const REFINER_HYPERTILE: &str = "refiner_hypertile";
    pub const REFINER_SAMPLER: &str = "refiner_sampler";
    pub const REFINER_SCHEDULER: &str = "refiner_scheduler";

    pub const VIDEO_MODEL: &str = "video_model";
    pub const VIDEO_SWAP_MODEL: &str = "video_swap_model";
    pub const VIDEO_SWAP_PERCENT: &str = "video_swap_percent";
    pub const VIDEO_FRAMES: &str = "video_frames";
    pub const VIDEO_FPS: &str = "video_fps";
    pub const VIDEO_STEPS: &str = "video_steps";
    pub const VIDEO_CFG: &str = "video_cfg";
    pub const VIDEO_RESOLUTION: &str = "video_resolution";
    pub const VIDEO_FORMAT: &str = "video_format";
    pub const VIDEO_BOOMERANG: &str = "video_boomerang";
    pub const VIDEO_PREVIEW_TYPE: &str = "video_preview_type";
    pub const VIDEO2VIDEO_CREATIVITY: &str = "video2video_creativity";
    pub const TEXT2VIDEO_FPS: &str = "text2video_fps";

    pub const VIDEO_EXTEND_MODEL: &str = "video_extend_model";
    pub const VIDEO_EXTEND_SWAP_MODEL: &str = "video_extend_swap_model";
    pub const VIDEO_EXTEND_SWAP_PERCENT: &str = "video_extend_swap_percent";
    pub const VIDEO_EXTEND_FORMAT: &str = "video_extend_format";
    pub const VIDEO_EXTEND_FRAME_OVERLAP: &str = "video_extend_frame_overlap";

    pub const TRIM_VIDEO_START_FRAMES: &str = "trim_video_start_frames";
    pub const TRIM_VIDEO_END_FRAMES: &str = "trim_video_end_frames";
    pub const VIDEO_FRAME_INTERPOLATION_METHOD: &str = "video_frame_interpolation_method";
    pub const VIDEO_FRAME_INTERPOLATION_MULTIPLIER: &str = "video_frame_interpolation_multiplier";
}

/// Section names for scoped lookups.
pub mod sections {
    /// Overrides for the first-stage image pass.
    pub const BASE: &str = "base";
    pub const VIDEO: &str = "video";
    pub const VIDEO_SWAP: &str = "videoswap";
    pub const REFINER: &str = "refiner";

    pub fn extend(index: usize) -> String {
        format!("extend{index}")
    }
}

pub const DEFAULT_IMAGE_SIZE: u32 = 512;

/// Read-only request parameters.
///
/// Top-level keys are the base section; the reserved `sections` key holds
/// named overrides (`{"sections": {"refiner": {"steps": 12}}}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    sections: HashMap<String, Map<String, Value>>,
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse parameter JSON")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("Failed to load parameters: {}", path.display()))
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn with_section(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    /// Whether `key` is present (and not null) in the base section.
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(v) if !v.is_null())
    }

    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        decode(self.values.get(key), key, None)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.try_get(key).unwrap_or(default)
    }

    /// Section-scoped lookup, optionally falling back to the base section.
    pub fn get_in<T: DeserializeOwned>(
        &self,
        key: &str,
        section: &str,
        include_base: bool,
    ) -> Option<T> {
        let scoped = self
            .sections
            .get(section)
            .and_then(|values| decode(values.get(key), key, Some(section)));
        if scoped.is_some() || !include_base {
            return scoped;
        }
        self.try_get(key)
    }

    /// Resolves a model-valued parameter. An unknown name is a user error.
    pub fn model(&self, registry: &ModelRegistry, key: &str) -> Result<Option<ModelEntry>> {
        let Some(name) = self.try_get::<String>(key) else {
            return Ok(None);
        };
        if name.trim().is_empty() {
            return Ok(None);
        }
        match registry.get(&name) {
            Some(entry) => Ok(Some(entry.clone())),
            None => Err(UserConfigError::UnknownModel {
                param: key.to_string(),
                name,
            }
            .into()),
        }
    }

    pub fn seed(&self) -> i64 {
        self.get(keys::SEED, 0)
    }

    pub fn image_width(&self) -> u32 {
        self.get(keys::WIDTH, DEFAULT_IMAGE_SIZE)
    }

    pub fn image_height(&self) -> u32 {
        self.get(keys::HEIGHT, DEFAULT_IMAGE_SIZE)
    }

    pub fn prompt(&self) -> String {
        self.get(keys::PROMPT, String::new())
    }

    pub fn negative_prompt(&self) -> String {
        self.get(keys::NEGATIVE_PROMPT, String::new())
    }
}

fn decode<T: DeserializeOwned>(value: Option<&Value>, key: &str, section: Option<&str>) -> Option<T> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(
                param = key,
                section = section.unwrap_or("base"),
                error = %err,
                "Ignoring parameter with unexpected type"
            );
            None
        }
    }
}
