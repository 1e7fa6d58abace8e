mod config;
mod error;
mod logging;
mod node;
mod server;
mod signals;

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::logging::init_logging;
use crate::signals::SignalManager;

fn main() -> Result<()> {
    let cli_config = std::env::args().nth(1);
    let config = DaemonConfig::from_sources(cli_config.as_deref())?;
    init_logging(&config)?;

    let node = node::build_node(&config)?;
    tracing::info!(
        event = "node.ready",
        id = node.id(),
        data_dir = %config.data_dir.display(),
        "node running"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (_signal_manager, shutdown) = SignalManager::install(node.clone())?;
        server::run(&config, node.clone(), shutdown).await
    })?;

    tracing::info!(event = "node.shutdown", "shutting down");
    node.close()?;
    Ok(())
}
