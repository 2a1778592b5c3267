//! Configuration loading, validation, and management for resilink.
//!
//! Loads configuration from `~/.resilink/config.toml` with environment
//! variable overrides. Validates all settings at startup. Every timing and
//! capacity constant of the resilience layer is fixed here at construction
//! time; nothing is tunable per call beyond the attempt count.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.resilink/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Liveness probing and reinjection
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Retry policy for applying yield state
    #[serde(default)]
    pub yield_guard: YieldGuardConfig,

    /// Chunked artifact cache
    #[serde(default)]
    pub artifact_cache: ArtifactCacheConfig,

    /// Ephemeral resource URL cache
    #[serde(default)]
    pub url_cache: UrlCacheConfig,

    /// Passive capture rules feeding the URL cache
    #[serde(default = "default_capture_rules")]
    pub capture: Vec<CaptureRuleConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a liveness probe waits for its acknowledgment
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Pause after reinjection before probing again
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Budget for delivering the payload once the context is reachable
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

impl SupervisorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldGuardConfig {
    /// Attempts used when the caller does not pass its own budget
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed pause between attempts (no backoff)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    150
}

impl YieldGuardConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for YieldGuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCacheConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_artifact_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_artifact_max_total_bytes")]
    pub max_total_bytes: u64,
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}
fn default_artifact_max_entries() -> usize {
    5
}
fn default_artifact_max_total_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ArtifactCacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_entries: default_artifact_max_entries(),
            max_total_bytes: default_artifact_max_total_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlCacheConfig {
    #[serde(default = "default_url_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_url_max_entries")]
    pub max_entries: usize,
}

fn default_url_ttl_secs() -> u64 {
    10 * 60
}
fn default_url_max_entries() -> usize {
    200
}

impl UrlCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for UrlCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_url_ttl_secs(),
            max_entries: default_url_max_entries(),
        }
    }
}

/// Which observed requests carry a capturable resource URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRuleConfig {
    /// Exact hostname to match
    pub host: String,

    /// Exact path to match
    pub path: String,

    /// Query parameter holding the logical resource id
    pub id_param: String,
}

fn default_capture_rules() -> Vec<CaptureRuleConfig> {
    vec![CaptureRuleConfig {
        host: "www.youtube.com".into(),
        path: "/api/timedtext".into(),
        id_param: "v".into(),
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.resilink/config.toml).
    ///
    /// `RESILINK_LOG_LEVEL` overrides the logging level.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(level) = std::env::var("RESILINK_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".resilink")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.probe_timeout_ms must be > 0".into(),
            ));
        }
        if self.yield_guard.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "yield_guard.max_attempts must be > 0".into(),
            ));
        }
        if self.artifact_cache.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "artifact_cache.chunk_size must be > 0".into(),
            ));
        }
        if self.artifact_cache.max_entries == 0 || self.url_cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache max_entries must be > 0".into(),
            ));
        }
        if self.artifact_cache.max_total_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "artifact_cache.max_total_bytes must be > 0".into(),
            ));
        }
        if self.url_cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "url_cache.ttl_secs must be > 0".into(),
            ));
        }
        if let Some(rule) = self
            .capture
            .iter()
            .find(|r| r.host.is_empty() || r.path.is_empty() || r.id_param.is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "capture rule has empty fields: {rule:?}"
            )));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            yield_guard: YieldGuardConfig::default(),
            artifact_cache: ArtifactCacheConfig::default(),
            url_cache: UrlCacheConfig::default(),
            capture: default_capture_rules(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
