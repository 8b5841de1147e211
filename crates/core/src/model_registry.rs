use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Compatibility class of a model, i.e. which node chains can drive it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CompatClass {
    Ltxv2,
    HunyuanVideo,
    HunyuanVideo15,
    Wan21,
    StableVideoDiffusion,
    StableDiffusionXl,
    StableDiffusionXlRefiner,
    Flux1,
    Other(String),
}

impl CompatClass {
    pub fn id(&self) -> &str {
        match self {
            Self::Ltxv2 => "ltxv2",
            Self::HunyuanVideo => "hunyuan-video",
            Self::HunyuanVideo15 => "hunyuan-video-1.5",
            Self::Wan21 => "wan-21",
            Self::StableVideoDiffusion => "stable-video-diffusion",
            Self::StableDiffusionXl => "stable-diffusion-xl-v1",
            Self::StableDiffusionXlRefiner => "stable-diffusion-xl-v1-refiner",
            Self::Flux1 => "flux-1",
            Self::Other(id) => id,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Self::Ltxv2
                | Self::HunyuanVideo
                | Self::HunyuanVideo15
                | Self::Wan21
                | Self::StableVideoDiffusion
        )
    }

    /// Whether sampling produces a single latent carrying both audio and video.
    pub fn has_joint_audio_video_latent(&self) -> bool {
        matches!(self, Self::Ltxv2)
    }

    /// Spatial rounding applied when fitting an image aspect into the model's
    /// pixel budget.
    pub fn resolution_precision(&self) -> u32 {
        match self {
            Self::HunyuanVideo => 16,
            _ => 64,
        }
    }

    pub fn default_video_cfg(&self) -> f64 {
        match self {
            Self::Ltxv2 => 3.0,
            Self::HunyuanVideo | Self::HunyuanVideo15 => 6.0,
            Self::Wan21 => 5.0,
            Self::StableVideoDiffusion => 2.5,
            _ => 7.0,
        }
    }
}

impl From<String> for CompatClass {
    fn from(id: String) -> Self {
        match id.as_str() {
            "ltxv2" => Self::Ltxv2,
            "hunyuan-video" => Self::HunyuanVideo,
            "hunyuan-video-1.5" => Self::HunyuanVideo15,
            "wan-21" => Self::Wan21,
            "stable-video-diffusion" => Self::StableVideoDiffusion,
            "stable-diffusion-xl-v1" => Self::StableDiffusionXl,
            "stable-diffusion-xl-v1-refiner" => Self::StableDiffusionXlRefiner,
            "flux-1" => Self::Flux1,
            _ => Self::Other(id),
        }
    }
}

impl From<CompatClass> for String {
    fn from(class: CompatClass) -> Self {
        class.id().to_string()
    }
}

impl std::fmt::Display for CompatClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub compat_class: CompatClass,
    /// Preferred width; `0` means the model does not declare one.
    #[serde(default)]
    pub standard_width: u32,
    #[serde(default)]
    pub standard_height: u32,
    #[serde(default)]
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "ltx-2-19b-dev".into(),
            compat_class: CompatClass::Ltxv2,
            standard_width: 1280,
            standard_height: 704,
            description: "LTX-2 joint audio/video model".into(),
        },
        ModelEntry {
            name: "hunyuan-video-t2v-720p".into(),
            compat_class: CompatClass::HunyuanVideo,
            standard_width: 1280,
            standard_height: 720,
            description: "HunyuanVideo text/image-to-video".into(),
        },
        ModelEntry {
            name: "hunyuan-video-1.5-i2v-720p".into(),
            compat_class: CompatClass::HunyuanVideo15,
            standard_width: 1280,
            standard_height: 720,
            description: "HunyuanVideo 1.5 image-to-video".into(),
        },
        ModelEntry {
            name: "wan2.1-i2v-480p".into(),
            compat_class: CompatClass::Wan21,
            standard_width: 832,
            standard_height: 480,
            description: "Wan 2.1 image-to-video 480p".into(),
        },
        ModelEntry {
            name: "svd-xt".into(),
            compat_class: CompatClass::StableVideoDiffusion,
            standard_width: 1024,
            standard_height: 576,
            description: "Stable Video Diffusion XT".into(),
        },
        ModelEntry {
            name: "sd-xl-base-1.0".into(),
            compat_class: CompatClass::StableDiffusionXl,
            standard_width: 1024,
            standard_height: 1024,
            description: "SDXL base".into(),
        },
        ModelEntry {
            name: "sd-xl-refiner-1.0".into(),
            compat_class: CompatClass::StableDiffusionXlRefiner,
            standard_width: 1024,
            standard_height: 1024,
            description: "SDXL refiner".into(),
        },
        ModelEntry {
            name: "flux1-dev".into(),
            compat_class: CompatClass::Flux1,
            standard_width: 1024,
            standard_height: 1024,
            description: "Flux.1 dev".into(),
        },
    ]
}

/// Model metadata lookup: compatibility class and resolution hints by name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models() -> Self {
        Self {
            entries: builtin_catalog(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn list_by_class(&self, class: &CompatClass) -> Vec<&ModelEntry> {
        self.entries
            .iter()
            .filter(|e| &e.compat_class == class)
            .collect()
    }

    pub fn insert(&mut self, entry: ModelEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            debug!(model = %entry.name, "Replacing catalog entry");
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    /// Merge a JSON catalog. Entries whose name is already known are skipped.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn load_from_path(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model catalog: {}", path.display()))?;
        let before = self.entries.len();
        self.load_json(&raw)
            .with_context(|| format!("Failed to load model catalog: {}", path.display()))?;
        info!(
            path = %path.display(),
            added = self.entries.len() - before,
            "Loaded model catalog"
        );
        Ok(())
    }
}
