//! # link-telemetry
//!
//! Installs the process-wide `tracing` subscriber: an [`EnvFilter`] built
//! from the configured level (`RUST_LOG` wins when set) feeding either a JSON
//! or a human-readable `fmt` layer. The format type is the one settings
//! files use, so a [`LoggingSettings`] maps straight onto a [`TelemetryConfig`].

#![deny(unsafe_code)]

use std::str::FromStr;

pub use link_settings::LogFormat;
use link_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Telemetry setup failures.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The level directive did not parse.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Configuration for [`init_telemetry`].
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module overrides, e.g. `("link_server", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// Output format.
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Config for the `logging` section of the gateway settings.
    pub fn from_settings(logging: &LoggingSettings) -> Result<Self, TelemetryError> {
        Ok(Self {
            log_level: parse_level(&logging.level)?,
            format: logging.format,
            ..Self::default()
        })
    }
}

/// Parse a level name (`error`, `warn`, `info`, `debug`, `trace`).
pub fn parse_level(value: &str) -> Result<Level, TelemetryError> {
    Level::from_str(value.trim()).map_err(|_| TelemetryError::InvalidLevel(value.to_owned()))
}

/// The filter directive string for `config`, e.g. `info,link_server=debug`.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push(',');
        directives.push_str(module);
        directives.push('=');
        directives.push_str(&level.to_string().to_lowercase());
    }
    directives
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let (json_layer, pretty_layer) = match config.format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;
    Ok(())
}
