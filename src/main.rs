//! cachewire server binary.
//!
//! Serves the bundled in-process cache over the cachewire protocol.
//! Configuration via CLI arguments or TOML file.

use cachewire::{Config, ConnectionManager};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        command_processors = config.command_processors,
        fragment_size = config.fragment_size,
        bad_client_detection = config.enable_bad_client_detection,
        max_memory_mb = config.max_memory / 1024 / 1024,
        default_ttl = config.default_ttl,
        "Starting cachewire server"
    );

    let server = ConnectionManager::with_local_cache(config);
    let serving = tokio::spawn(Arc::clone(&server).run());

    tokio::select! {
        result = serving => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            server.shutdown();
        }
    }

    Ok(())
}
