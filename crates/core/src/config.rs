use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;
use crate::params::{GuardLimits, UpscaleConfig};
use crate::session::{ExecutionBackend, OrtSessionConfig};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TESSERA_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleConfig,
    pub limits: GuardLimits,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub model_cache_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution providers in priority order: `tensorrt`, `cuda`, `cpu`.
    pub backends: Vec<String>,
    /// 0 lets ONNX Runtime decide.
    pub intra_threads: usize,
    /// Multiplier applied to model input and divided out of its output;
    /// 255.0 for models trained on `[0, 255]`.
    pub value_scale: f32,
    pub model_load_timeout_secs: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_cache_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backends: vec!["cuda".to_string(), "cpu".to_string()],
            intra_threads: 0,
            value_scale: 1.0,
            model_load_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn parsed_backends(&self) -> Vec<ExecutionBackend> {
        self.backends
            .iter()
            .map(|name| ExecutionBackend::from_str_lossy(name))
            .collect()
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

    /// Session settings with cache paths resolved against `data_dir`.
    pub fn session_config(&self, data_dir: &Path) -> OrtSessionConfig {
        OrtSessionConfig {
            backends: self.engine.parsed_backends(),
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
            intra_threads: self.engine.intra_threads,
            value_scale: self.engine.value_scale,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            model_load_timeout: Duration::from_secs(self.engine.model_load_timeout_secs),
            limits: self.limits,
            ..Default::default()
        }
    }

    pub fn model_cache_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.model_cache_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TESSERA_DATA_DIR environment variable
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

/// Creates the data directory and writes a default `config.toml` unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

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
    use tempfile::tempdir;

    #[test]
    fn test_default_config_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.model_cache_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.upscale, UpscaleConfig::default());
        assert_eq!(cfg.limits.max_blocks, 1000);
        assert_eq!(cfg.engine.backends, vec!["cuda", "cpu"]);
        assert_eq!(cfg.engine.model_load_timeout_secs, 60);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut original = AppConfig::default();
        original.upscale.tile_size = 192;
        original.engine.value_scale = 255.0;
        let encoded = toml::to_string_pretty(&original).unwrap();
        let decoded: AppConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[upscale]\nscale = 4\n\n[engine]\nbackends = [\"tensorrt\"]\n").unwrap();

        let cfg = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.upscale.scale, 4);
        assert_eq!(cfg.upscale.tile_size, 256);
        assert_eq!(cfg.engine.parsed_backends(), vec![ExecutionBackend::Tensorrt]);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn test_load_missing_or_empty_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(AppConfig::load_from_path(&missing).unwrap(), AppConfig::default());

        let empty = dir.path().join("empty.toml");
        fs::write(&empty, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&empty).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[upscale\nscale = ").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn test_data_dir_resolution() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));

        let previous = env::var_os(ENV_DATA_DIR);
        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);
        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn test_initialize_writes_defaults_once() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("data");
        initialize_data_dir(&root).unwrap();
        let cfg_path = config_path(&root);
        assert!(cfg_path.exists());
        assert_eq!(AppConfig::load_from_path(&cfg_path).unwrap(), AppConfig::default());

        fs::write(&cfg_path, "[upscale]\nscale = 3\n").unwrap();
        initialize_data_dir(&root).unwrap();
        assert_eq!(
            fs::read_to_string(&cfg_path).unwrap(),
            "[upscale]\nscale = 3\n"
        );
    }

    #[test]
    fn test_session_and_engine_settings() {
        let mut cfg = AppConfig::default();
        cfg.paths.trt_cache_dir = PathBuf::from("/abs/trt");
        cfg.engine.model_load_timeout_secs = 5;
        cfg.limits.max_blocks = 10;

        let session = cfg.session_config(Path::new("/data"));
        assert_eq!(session.trt_cache_dir, Some(PathBuf::from("/abs/trt")));
        assert_eq!(
            session.backends,
            vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu]
        );

        let options = cfg.engine_options();
        assert_eq!(options.model_load_timeout, Duration::from_secs(5));
        assert_eq!(options.limits.max_blocks, 10);
        assert_eq!(cfg.model_cache_dir(Path::new("/data")), PathBuf::from("/data/models"));
    }

    #[test]
    fn test_resolve_relative_to() {
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
