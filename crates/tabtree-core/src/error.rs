//! Error types for tabtree-core

use crate::model::TabId;
use std::path::PathBuf;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = format!("To fix:\n  {}\n", self.summary);
        for alt in &self.alternatives {
            output.push_str("  - ");
            output.push_str(alt);
            output.push('\n');
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tabtree-core
#[derive(Error, Debug)]
pub enum Error {
    /// Durable key-value storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Host browser API errors
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, closed channels)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(_) => Some(
                Remediation::new("Check that the store directory exists and is writable.")
                    .alternative("Run `tt cleanup` to rewrite the stored state."),
            ),
            Self::Config(_) => Some(
                Remediation::new("Fix the config file, or remove it to fall back to defaults.")
                    .alternative("Print the effective defaults with `tt config`."),
            ),
            Self::Io(_) => Some(Remediation::new(
                "Check filesystem permissions and paths, then retry.",
            )),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Each replay line must be a single JSON object."),
            ),
            Self::Host(_) | Self::Runtime(_) => None,
        }
    }
}

/// Durable storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// A stored value could not be read back
    #[error("failed to read key {key}: {reason}")]
    Read { key: String, reason: String },

    /// A batched write was rejected by the backing store
    #[error("write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Host browser API errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The tab no longer exists (closed between event and lookup)
    #[error("tab not found: {0}")]
    TabNotFound(TabId),

    /// The host API refused or failed the call
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_has_remediation() {
        let err = Error::from(StorageError::Write("disk full".to_string()));
        let remediation = err.remediation().expect("remediation");
        assert!(remediation.render_plain().contains("writable"));
        assert_eq!(err.to_string(), "Storage error: write failed: disk full");
    }

    #[test]
    fn host_errors_are_not_actionable() {
        let err = Error::from(HostError::TabNotFound(TabId(7)));
        assert!(err.remediation().is_none());
        assert_eq!(err.to_string(), "Host error: tab not found: 7");
    }
}
