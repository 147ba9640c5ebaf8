//! Logging setup for the node binaries

use std::str::FromStr;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use gate_core::{GateError, GateResult};

/// Environment variable holding the log filter directives
pub const LOG_ENV: &str = "GATE_LOG";

/// Default filter when `GATE_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(GateError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `GATE_LOG` is unset
    pub filter: Option<String>,
}

/// Build the filter from `GATE_LOG`, falling back to the configured one
pub fn env_filter(config: &LoggingConfig) -> GateResult<EnvFilter> {
    match std::env::var(LOG_ENV) {
        Ok(directives) => EnvFilter::try_new(&directives)
            .map_err(|e| GateError::Config(format!("{}: {}", LOG_ENV, e))),
        Err(_) => {
            let fallback = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
            EnvFilter::try_new(fallback).map_err(|e| GateError::Config(e.to_string()))
        }
    }
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> GateResult<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| GateError::Config(format!("logging already initialised: {}", e)))
}
