//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use repokit_core::config::LoggingConfig;
use repokit_core::{AppError, AppResult};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. The format is `"json"` or
/// anything else for the pretty formatter. Fails when a subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .try_init(),
        _ => fmt()
            .pretty()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };
    result.map_err(|e| AppError::configuration(format!("Failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use repokit_core::ErrorKind;

    #[test]
    fn test_second_install_is_a_configuration_error() {
        let config = LoggingConfig {
            level: "debug".into(),
            format: "pretty".into(),
        };
        let _ = init_logging(&config);
        let err = init_logging(&config).unwrap_err();
        assert!(err.is(ErrorKind::Configuration));
    }
}
