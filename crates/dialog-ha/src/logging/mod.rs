//! Logging setup
//!
//! dialog-ha itself only emits `tracing` events. Applications that do not
//! install a subscriber of their own can call [`setup_logging`]; `RUST_LOG`
//! directives are honoured on top of the configured level.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{HaError, HaResult};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span open/close
    pub log_spans: bool,
    /// Whether to print the event target (module path)
    pub with_target: bool,
    /// Application name to include in the startup line
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            file_info: false,
            log_spans: false,
            with_target: true,
            app_name: "rvoip-dialog-ha".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }
}

/// Install a global `fmt` subscriber
///
/// Fails with a configuration error when a global subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> HaResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_target(config.with_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .try_init()
        .map_err(|e| HaError::config(format!("cannot install log subscriber: {}", e)))?;

    tracing::info!("Starting {} v{}", config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> HaResult<Level> {
    Level::from_str(level).map_err(|_| HaError::config(format!("Invalid log level: {}", level)))
}
