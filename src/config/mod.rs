//! Kernel configuration loading (feature `config-loader`).
//!
//! Supplies defaults for the three knobs the kernel itself owns — smart
//! retry policy, the `control.maxIterations` ceiling, and the LLM call
//! timeout — loadable from a TOML/YAML/JSON file with environment-variable
//! overlay, the same layering the teacher's `config` module builds over
//! the `config` crate.

use crate::retry::{RetryConfig, RetryStrategy};
use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parsing error: {0}")]
    Parse(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("config deserialization error: {0}")]
    Deserialization(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detects a config format from a file's extension. Only the formats this
/// crate actually enables on the `config` dependency (§9: toml, json,
/// yaml) are supported; anything else is `UnsupportedFormat`.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;
    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Serializable mirror of [`RetryConfig`]'s duration fields (milliseconds,
/// so it round-trips through every supported format without a custom
/// `Duration` (de)serializer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            strategy: defaults.strategy,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            strategy: self.strategy,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            retry_on_exceptions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub max_iterations: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self { max_iterations: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub call_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self { call_timeout_secs: 120 }
    }
}

/// Everything the kernel reads out of an on-disk config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    pub retry: RetrySettings,
    pub control: ControlSettings,
    pub llm: LlmSettings,
}

impl KernelSettings {
    /// Loads settings from `path` (format auto-detected from its
    /// extension), overlaid with environment variables prefixed
    /// `AUTO_AGENT__` (double underscore separating nesting, e.g.
    /// `AUTO_AGENT__RETRY__MAX_RETRIES`). Falls back to
    /// [`KernelSettings::default`] entirely if the file does not exist.
    pub fn load(path: &str) -> ConfigResult<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let format = detect_format(path)?;
        let builder = Cfg::builder()
            .add_source(File::with_name(path).format(format))
            .add_source(Environment::with_prefix("AUTO_AGENT").separator("__"));
        let built = builder.build().map_err(|e| ConfigError::Parse(e.to_string()))?;
        built.try_deserialize().map_err(|e| ConfigError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_format_recognizes_supported_extensions() {
        assert_eq!(detect_format("kernel.toml").unwrap(), FileFormat::Toml);
        assert_eq!(detect_format("kernel.yaml").unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format("kernel.yml").unwrap(), FileFormat::Yaml);
        assert_eq!(detect_format("kernel.json").unwrap(), FileFormat::Json);
        assert!(detect_format("kernel.ini").is_err());
        assert!(detect_format("kernel").is_err());
    }

    #[test]
    fn default_settings_match_retry_config_defaults() {
        let settings = KernelSettings::default();
        let retry = settings.retry.to_retry_config();
        assert_eq!(retry.max_retries, RetryConfig::default().max_retries);
        assert_eq!(settings.control.max_iterations, 20);
        assert_eq!(settings.llm.call_timeout_secs, 120);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = KernelSettings::load("/nonexistent/path/kernel.toml").unwrap();
        assert_eq!(settings.control.max_iterations, 20);
    }

    #[test]
    fn loads_toml_file_and_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.toml");
        std::fs::write(&path, "[control]\nmax_iterations = 42\n").unwrap();
        let settings = KernelSettings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.control.max_iterations, 42);
        assert_eq!(settings.llm.call_timeout_secs, 120);
    }
}
