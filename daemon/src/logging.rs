use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

/// Initializes the global subscriber. Core modules log through the
/// `log` facade; the default `tracing-log` bridge picks those up too.
pub fn init_logging(config: &DaemonConfig) -> Result<()> {
    let level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|err| DaemonError::Logger(err.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| DaemonError::Logger(err.to_string()))?;

    Ok(())
}
