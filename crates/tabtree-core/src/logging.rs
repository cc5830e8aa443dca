//! Structured logging for tabtree
//!
//! Logging goes through `tracing`. Call [`init_logging`] once at process
//! start; library code only emits events.
//!
//! # Correlation Fields
//!
//! Use these field names consistently:
//! - `tab_id`, `parent_id`, `window_id`: runtime ids
//! - `url`: normalized URL of the tab involved
//! - `key`: durable storage key
//! - `feature`: settings flag name

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error, or a full directive).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    pub format: LogFormat,

    /// Optional file that receives a copy of every event
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Build the event filter: `RUST_LOG` first, then the configured level.
pub fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|_| LogError::InvalidLevel(level.to_string()))
}

fn open_log_file(path: &std::path::Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Initialize the global logging subscriber.
///
/// Subsequent calls return `Err(LogError::AlreadyInitialized)`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(LogError::AlreadyInitialized);
    }
    if let Err(err) = install_subscriber(config) {
        // Leave the slot free so a corrected config can be retried.
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(err);
    }

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

fn install_subscriber(config: &LogConfig) -> Result<(), LogError> {
    let env_filter = build_filter(&config.level)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_ansi(true),
            );
            if let Some(file) = file {
                let file_layer = fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_target(true)
                    .with_ansi(false);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(io::stderr)
                    .with_target(true)
                    .flatten_event(true),
            );
            if let Some(file) = file {
                let file_layer = fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_target(true)
                    .flatten_event(true);
                tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
            } else {
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
    }

    Ok(())
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn json_layer_flattens_correlation_fields() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .json()
                .with_writer(writer.clone())
                .flatten_event(true),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(tab_id = 12, parent_id = 3, "relation recorded");
        });

        let line = writer.contents();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["tab_id"], 12);
        assert_eq!(value["parent_id"], 3);
        assert_eq!(value["message"], "relation recorded");
    }

    #[test]
    fn global_init_claims_once_and_survives_a_bad_config() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let bad = LogConfig {
            level: "tabtree=loudest".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init_logging(&bad), Err(LogError::InvalidLevel(_))));
        assert!(!is_logging_initialized());

        let good = LogConfig {
            level: "warn".to_string(),
            ..LogConfig::default()
        };
        init_logging(&good).unwrap();
        assert!(is_logging_initialized());
        assert!(matches!(init_logging(&good), Err(LogError::AlreadyInitialized)));
    }

    #[test]
    fn malformed_level_directive_is_rejected() {
        // Only meaningful when RUST_LOG is not set in the test environment.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                build_filter("tabtree=loudest"),
                Err(LogError::InvalidLevel(_))
            ));
            assert!(build_filter("tabtree_core=debug").is_ok());
        }
    }
}
