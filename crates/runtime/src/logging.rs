//! Subscriber setup for hosts embedding the layer.

use resilink_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level. A second call leaves the installed subscriber alone and returns
/// an error instead of panicking.
pub fn init(config: &LoggingConfig) -> Result<(), InitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    }
}
