//! Agora - event discussion server
//!
//! Loads the server configuration, opens the message archive when it is
//! enabled and hosts discussions until interrupted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_core::{Database, ServerConfig};
use agora_net::{Server, SharedArchive};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to connections to flush the shutdown notice
const SHUTDOWN_GRACE_MS: u64 = 200;

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Agora");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        tracing::error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> agora_net::Result<()> {
    let config = ServerConfig::load_default()?;
    let archive = open_archive(&config)?;

    let server = Server::start(config, archive).await?;
    tracing::info!(addr = %server.addr(), "Accepting discussions");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");

    server.shutdown();
    tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
    Ok(())
}

fn open_archive(config: &ServerConfig) -> agora_net::Result<Option<SharedArchive>> {
    if !config.archive.enabled {
        return Ok(None);
    }

    let path = config.archive.resolved_path()?;
    tracing::info!(path = %path.display(), "Opening message archive");

    let archive: SharedArchive = Arc::new(Mutex::new(Database::open(&path)?));
    Ok(Some(archive))
}
