//! Logging setup.
//!
//! The crate logs through [`tracing`] and never installs a subscriber by
//! itself. Host programs that have no subscriber of their own can call
//! [`init_logging`] once at startup. `RUST_LOG` takes precedence over the
//! configured level, so the session's illegal-state warnings can be silenced
//! with e.g. `RUST_LOG=perfdump=error`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level filter directive (trace, debug, info, warn, error, or a full
    /// `EnvFilter` directive).
    #[serde(default = "default_level")]
    pub level: String,

    /// Whether to print the event target.
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to colorize output.
    #[serde(default)]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            with_target: true,
            ansi: false,
        }
    }
}

impl LogConfig {
    /// Builds the level filter: `RUST_LOG` if set and valid, else `level`.
    pub fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| Error::Config(format!("log level {:?}: {}", self.level, e))),
        }
    }
}

/// Installs a global stderr subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_ansi(config.ansi);

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(layer)
        .try_init()
        .map_err(|e| Error::Config(format!("installing log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.level, "info");
        assert!(config.with_target);
    }

    #[test]
    fn test_filter_directive() {
        let config = LogConfig {
            level: "perfdump=debug,warn".into(),
            ..LogConfig::default()
        };
        assert!(config.filter().is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::default();
        let _ = init_logging(&config);
        assert!(matches!(init_logging(&config), Err(Error::Config(_))));
    }
}
