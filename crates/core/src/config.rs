use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDGRAPH_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub generation: GenerationDefaults,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Extra JSON model catalog merged over the built-in one, if present.
    pub model_catalog: PathBuf,
    pub output_dir: PathBuf,
}

/// Numbers the stages fall back to when a request leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationDefaults {
    pub dynamic_id_base: u64,
    pub default_video_fps: u32,
    pub default_video_steps: u32,
    pub default_video_frames: u32,
    pub fallback_model_width: u32,
    pub fallback_model_height: u32,
    pub extend_frame_overlap: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_catalog: PathBuf::from("models.json"),
            output_dir: PathBuf::from("workflows"),
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            dynamic_id_base: 50000,
            default_video_fps: 24,
            default_video_steps: 20,
            default_video_frames: 25,
            fallback_model_width: 1024,
            fallback_model_height: 576,
            extend_frame_overlap: 9,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: 14,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory:
/// 1. CLI override if provided
/// 2. VIDGRAPH_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged when absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.model_catalog, PathBuf::from("models.json"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("workflows"));

        assert_eq!(cfg.generation.dynamic_id_base, 50000);
        assert_eq!(cfg.generation.default_video_fps, 24);
        assert_eq!(cfg.generation.default_video_steps, 20);
        assert_eq!(cfg.generation.default_video_frames, 25);
        assert_eq!(cfg.generation.fallback_model_width, 1024);
        assert_eq!(cfg.generation.fallback_model_height, 576);
        assert_eq!(cfg.generation.extend_frame_overlap, 9);
        assert_eq!(cfg.logging.retention_files, 14);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.generation.extend_frame_overlap = 5;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let decoded: AppConfig =
            toml::from_str("[generation]\ndefault_video_fps = 30\n").expect("deserialize config");
        assert_eq!(decoded.generation.default_video_fps, 30);
        assert_eq!(decoded.generation.dynamic_id_base, 50000);
        assert_eq!(decoded.paths, PathsConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write empty config");
        let loaded = AppConfig::load_from_path(&path).expect("load empty config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_invalid_file_reports_path() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[generation\n").expect("write broken config");
        let err = AppConfig::load_from_path(&path).expect_err("broken config should fail");
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
        let old = env::var(ENV_DATA_DIR).ok();

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let data = temp.path().join("nested").join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).expect("load written config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[logging]\nretention_files = 3\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_absolute_and_relative() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
