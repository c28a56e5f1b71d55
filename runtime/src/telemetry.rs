//! Tracing bootstrap.

use meshbus_core::config::ObservabilityConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Failure to install the global subscriber.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The configured level is not a valid filter directive.
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter {
        /// Directive that failed to parse.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already set.
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `config.log_level`.
///
/// # Errors
///
/// Returns [`TelemetryError`] if the level is invalid or a global subscriber
/// was already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            TelemetryError::InvalidFilter {
                filter: config.log_level.clone(),
                reason: e.to_string(),
            }
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_level() {
        // RUST_LOG takes precedence over the configured level.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = ObservabilityConfig {
            log_level: "meshbus=loud".to_string(),
            ..ObservabilityConfig::default()
        };
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}
