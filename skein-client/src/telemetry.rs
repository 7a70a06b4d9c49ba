//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set.

use skein_core::{ClientError, ClientResult, LogConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> ClientResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ClientError::Config(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().compact()).try_init()
    };
    result.map_err(|e| ClientError::Config(format!("Failed to init subscriber: {}", e)))?;

    tracing::debug!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LogConfig {
            level: "skein=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(init_tracing(&config), Err(ClientError::Config(_))));
    }
}
