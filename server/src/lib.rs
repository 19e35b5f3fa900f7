//! # Lobby Server Library
//!
//! This library provides the authoritative server for real-time party game
//! lobbies. Clients connect over WebSocket, create or join a game identified
//! by a short code, and receive push notices when other players join, leave,
//! start, stop or destroy the game.
//!
//! ## Core Responsibilities
//!
//! ### Consistent State
//! The server keeps three views of the world in step: the live connections,
//! the persisted game and player records, and the code-to-game lookup. A
//! command either changes all of them or leaves them as they were, even when
//! the store fails halfway through a multi-step write.
//!
//! ### Connection Lifecycle
//! Handles the complete lifecycle of client connections including:
//! - Connection acceptance and capacity limits
//! - Binding a connection to the player it created or joined as
//! - Disconnection handling, which leaves the game on the player's behalf
//!
//! ### Notifications
//! Every state change is pushed to the other members of the affected game
//! on the same ordered channel that carries command responses. That channel
//! is bounded; a client that stops reading is disconnected instead of
//! growing the server's memory.
//!
//! ## Architecture Design
//!
//! ### Single Coordinator Task
//! All lobby state lives in one task that drains a bounded request queue.
//! Connection tasks submit a command and await its response before reading
//! the next frame. This removes any interleaving between commands without
//! locks around the registries.
//!
//! ### Bounded Store Calls
//! Persistence sits behind the [`store::Store`] trait. The gateway wraps
//! each call in a timeout so a slow backend delays, but never wedges, the
//! coordinator.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Record types and the storage trait with in-memory and snapshot-file
//! implementations.
//!
//! ### Gateway Module (`gateway`)
//! Game and player CRUD with cascading deletes, username checks and the
//! code cache from the `codes` module.
//!
//! ### Connection Registry Module (`connection_registry`)
//! Live connections, their outbound queues and their player bindings.
//!
//! ### Coordinator Module (`coordinator`)
//! The six lobby commands, disconnect cleanup and the actor loop.
//!
//! ### Router Module (`router`)
//! Frame validation and the command handler table.
//!
//! ### Network Module (`network`)
//! WebSocket accept loop and per-connection reader and writer tasks.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Config;
//! use server::connection_registry::ConnectionRegistry;
//! use server::coordinator::{self, Coordinator};
//! use server::gateway::Gateway;
//! use server::network::Server;
//! use server::router::Router;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let gateway = Gateway::new(Arc::new(MemoryStore::new()), config.store_timeout());
//!     let coordinator = Coordinator::new(gateway, ConnectionRegistry::new(config.max_connections));
//!
//!     let (handle, _task) =
//!         coordinator::spawn(coordinator, Router::with_default_handlers(), config.queue_capacity);
//!
//!     Server::bind(&config, handle).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod codes;
pub mod config;
pub mod connection_registry;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod network;
pub mod router;
pub mod store;
