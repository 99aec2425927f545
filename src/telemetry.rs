//! Tracing infrastructure.
//!
//! Structured, async-aware logging built on the `tracing` and
//! `tracing-subscriber` crates:
//! - Structured events with fields
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//!
//! # Example
//! ```no_run
//! use labrig::{config::RigConfig, telemetry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RigConfig::load()?;
//! telemetry::init(&telemetry::TelemetryConfig::from_config(&config)?)?;
//! tracing::info!("rig starting");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::RigConfig;
use crate::error::{RigError, RigResult};

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format (for production)
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Whether to include the event's module path.
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Derive tracing settings from the rig configuration.
    pub fn from_config(config: &RigConfig) -> RigResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.rig.log_level)?,
            format: parse_log_format(&config.rig.log_format)?,
            ..Default::default()
        })
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, takes precedence over the configured level. Returns
/// an error if a global subscriber is already installed.
pub fn init(config: &TelemetryConfig) -> RigResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let result = match config.format {
        OutputFormat::Pretty => builder.pretty().try_init(),
        OutputFormat::Compact => builder.compact().try_init(),
        OutputFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| RigError::Configuration(format!("tracing init failed: {e}")))
}

fn parse_log_level(level: &str) -> RigResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(RigError::Configuration(format!(
            "Invalid log level '{other}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn parse_log_format(format: &str) -> RigResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        other => Err(RigError::Configuration(format!(
            "Invalid log format '{other}'. Must be one of: pretty, compact, json"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json").unwrap(), OutputFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_config_derivation() {
        let mut config = RigConfig::default();
        config.rig.log_level = "trace".to_string();
        config.rig.log_format = "compact".to_string();

        let telemetry = TelemetryConfig::from_config(&config).unwrap();
        assert_eq!(telemetry.level, Level::TRACE);
        assert_eq!(telemetry.format, OutputFormat::Compact);
    }
}
