//! Configuration management for tabtree
//!
//! Configuration is a single TOML document. Every section and every field is
//! optional; missing values fall back to the defaults below.
//!
//! ```toml
//! [storage]
//! flush_interval_ms = 5000
//!
//! [relations]
//! max_records = 500
//! retention_days = 30
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use crate::error::ConfigError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Invalid(format!("unknown log format: {other}"))),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabTreeConfig {
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub relations: RelationsConfig,
    pub pinned: PinnedConfig,
    pub history: HistoryConfig,
    pub settings: SettingsConfig,
    pub window: WindowConfig,
    pub scroll: ScrollConfig,
    pub logging: LogConfig,
}

/// Delay-coalescing executor timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay before a queued tab index snapshot refresh runs
    pub snapshot_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            snapshot_delay_ms: 200,
        }
    }
}

/// Durable write coalescing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// How long mutations accumulate before one batched write
    pub flush_interval_ms: u64,
    /// Delay before retrying a failed batched write
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            retry_backoff_ms: 1_000,
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Durable relation log bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationsConfig {
    /// Maximum number of records kept; oldest inserted are dropped first
    pub max_records: usize,
    /// Records older than this are purged by cleanup
    pub retention_days: u64,
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            max_records: 500,
            retention_days: 30,
        }
    }
}

impl RelationsConfig {
    pub fn retention_ms(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_MS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinnedConfig {
    pub retention_days: u64,
}

impl Default for PinnedConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl PinnedConfig {
    pub fn retention_ms(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_MS)
    }
}

/// Navigation history bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    /// How long a back/forward traversal suppresses history recording
    pub navigation_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            navigation_timeout_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Freshness window of the cached settings object
    pub cache_ttl_secs: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

impl SettingsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Window lifecycle heuristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Parent assignment is suppressed for this long after a normal window opens
    pub restore_guard_ms: u64,
    /// Debounce before a focus change triggers a relation restore
    pub focus_restore_delay_ms: u64,
    /// Wait after a link click before parenting the newly active tab
    pub link_click_settle_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            restore_guard_ms: 3_000,
            focus_restore_delay_ms: 1_000,
            link_click_settle_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    pub retention_days: u64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

impl ScrollConfig {
    pub fn retention_ms(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_MS)
    }
}

impl TabTreeConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would stall timers or empty bounded collections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("scheduler.snapshot_delay_ms", self.scheduler.snapshot_delay_ms == 0),
            ("storage.flush_interval_ms", self.storage.flush_interval_ms == 0),
            ("storage.retry_backoff_ms", self.storage.retry_backoff_ms == 0),
            ("relations.max_records", self.relations.max_records == 0),
            ("history.max_entries", self.history.max_entries == 0),
        ];
        for (field, invalid) in checks {
            if invalid {
                return Err(ConfigError::Invalid(format!("{field} must be greater than 0")));
            }
        }
        Ok(())
    }
}
