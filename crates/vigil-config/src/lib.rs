use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const VIGIL_DIR_NAME: &str = ".vigil";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_MAX_SNAPSHOTS: u64 = 500;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_WARNING_THRESHOLD: u8 = 40;
pub const DEFAULT_CRITICAL_THRESHOLD: u8 = 70;
pub const DEFAULT_WINDOW_SIZE: usize = 5;
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VigilConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub drift: DriftConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub seed_baseline: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            seed_baseline: true,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u8,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u8,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            window_size: DEFAULT_WINDOW_SIZE,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn vigil_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(VIGIL_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    vigil_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(workspace_root: impl AsRef<Path>) -> Result<VigilConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(VigilConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: VigilConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<VigilConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(vigil_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = VigilConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Reports settings that were accepted but will be clamped or look unintended.
pub fn validate_config(config: &VigilConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.drift.warning_threshold > 100 || config.drift.critical_threshold > 100 {
        warnings.push(ConfigWarning {
            code: "drift_threshold_out_of_range",
            message: "drift thresholds above 100 can never trigger".to_owned(),
        });
    }
    if config.drift.warning_threshold >= config.drift.critical_threshold {
        warnings.push(ConfigWarning {
            code: "drift_thresholds_inverted",
            message: format!(
                "drift.warning_threshold ({}) should be below drift.critical_threshold ({})",
                config.drift.warning_threshold, config.drift.critical_threshold
            ),
        });
    }
    if config.session.max_snapshots == 0 {
        warnings.push(ConfigWarning {
            code: "session_max_snapshots_zero",
            message: "session.max_snapshots = 0 abandons every session on its first change"
                .to_owned(),
        });
    }
    if config.drift.provider_timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "drift_provider_timeout_zero",
            message: "drift.provider_timeout_ms = 0 skips every drift check".to_owned(),
        });
    }

    warnings
}

fn default_bind() -> String {
    DEFAULT_BIND.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_snapshots() -> u64 {
    DEFAULT_MAX_SNAPSHOTS
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_warning_threshold() -> u8 {
    DEFAULT_WARNING_THRESHOLD
}

fn default_critical_threshold() -> u8 {
    DEFAULT_CRITICAL_THRESHOLD
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_provider_timeout_ms() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_MS
}

fn normalize_config(mut config: VigilConfig) -> VigilConfig {
    let bind = config.server.bind.trim();
    if bind.is_empty() {
        config.server.bind = default_bind();
    } else {
        config.server.bind = bind.to_owned();
    }

    config.drift.window_size = config.drift.window_size.max(1);
    config.session.sweep_interval_secs = config.session.sweep_interval_secs.max(1);

    config
}
