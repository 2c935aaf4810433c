//! # veil-config
//!
//! Configuration management for gitveil.
//!
//! Loads configuration from:
//! 1. `~/.gitveil/config.toml` (global)
//! 2. `.gitveil/config.toml` (repository-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod context;
pub mod logging;
pub mod path;

pub use context::{CaseSensitivity, VeilContext};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<VeilConfig>> =
    Lazy::new(|| RwLock::new(VeilConfig::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, VeilConfig> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = VeilConfig::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub layout: LayoutConfig,
    pub runner: RunnerConfig,
    pub hydration: HydrationConfig,
}

impl VeilConfig {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = VeilConfig::default();

        // 1. Load global config (~/.gitveil/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load repo config (.gitveil/config.toml) - overrides global
        let repo_path = Path::new(".gitveil/config.toml");
        if repo_path.exists() {
            debug!("Loading repo config from {:?}", repo_path);
            let contents = std::fs::read_to_string(repo_path)?;
            let repo_config: VeilConfig = toml::from_str(&contents)?;
            config.merge(repo_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.gitveil/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".gitveil/config.toml"))
    }

    /// Merge a repo-local config over this one
    fn merge(&mut self, other: VeilConfig) {
        let defaults = VeilConfig::default();
        if other.layout.metadata_dir_name != defaults.layout.metadata_dir_name {
            self.layout.metadata_dir_name = other.layout.metadata_dir_name;
        }
        if other.layout.database_dir_name != defaults.layout.database_dir_name {
            self.layout.database_dir_name = other.layout.database_dir_name;
        }
        if other.runner.retry_interval_ms != defaults.runner.retry_interval_ms {
            self.runner.retry_interval_ms = other.runner.retry_interval_ms;
        }
        if other.hydration.threads.is_some() {
            self.hydration.threads = other.hydration.threads;
        }
        if other.hydration.max_retries != defaults.hydration.max_retries {
            self.hydration.max_retries = other.hydration.max_retries;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(threads) = std::env::var("GITVEIL_HYDRATION_THREADS") {
            if let Ok(n) = threads.parse() {
                self.hydration.threads = Some(n);
            }
        }
        if let Ok(interval) = std::env::var("GITVEIL_RETRY_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.runner.retry_interval_ms = ms;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&VeilConfig::default()).unwrap()
    }
}

/// On-disk layout of the virtualization metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Name of the repository metadata directory (`.git` equivalent)
    pub metadata_dir_name: String,
    /// Name of the durable-store directory inside the metadata directory
    pub database_dir_name: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            metadata_dir_name: ".git".to_string(),
            database_dir_name: "gitveil/databases".to_string(),
        }
    }
}

/// Background runner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Backoff between repository-lock acquisition attempts
    pub lock_backoff_ms: u64,
    /// Consecutive failed lock attempts before a warning is logged
    pub lock_warn_threshold: u32,
    /// Sleep before retrying a task whose handler reported a retryable error
    pub retry_interval_ms: u64,
    /// Consecutive retryable failures of one task before a warning is logged
    pub retry_warn_threshold: u32,
    /// Emit a progress event after this many processed tasks
    pub progress_interval: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_backoff_ms: 25,
            lock_warn_threshold: 200,
            retry_interval_ms: 1000,
            retry_warn_threshold: 10,
            progress_interval: 25_000,
        }
    }
}

/// Hydration worker pool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    /// Number of hydration worker threads (None = auto)
    pub threads: Option<usize>,
    /// Attempts per object before a transient store failure is given up on
    pub max_retries: u32,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            threads: None,
            max_retries: 3,
        }
    }
}
