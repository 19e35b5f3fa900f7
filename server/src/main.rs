use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use server::config::Config;
use server::connection_registry::ConnectionRegistry;
use server::coordinator::{self, Coordinator};
use server::gateway::Gateway;
use server::network::Server;
use server::router::Router;
use server::store::{FileStore, MemoryStore, Store};

/// Parses the configuration, restores stored games and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::parse();

    let store: Arc<dyn Store> = match &config.data_file {
        Some(path) => {
            info!("Persisting games to {}", path.display());
            Arc::new(FileStore::open(path).await?)
        }
        None => {
            info!("Keeping games in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let mut gateway = Gateway::new(store, config.store_timeout());
    gateway.restore().await?;

    let coordinator = Coordinator::new(gateway, ConnectionRegistry::new(config.max_connections));
    let (handle, coordinator_task) = coordinator::spawn(
        coordinator,
        Router::with_default_handlers(),
        config.queue_capacity,
    );

    let server = Server::bind(&config, handle).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        result = coordinator_task => {
            if let Err(e) = result {
                error!("Coordinator task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
