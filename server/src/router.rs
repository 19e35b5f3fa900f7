//! Command routing: inbound text frame in, one [`Response`] out
//!
//! Frames are validated into a typed [`Command`] before any handler runs.
//! The handler table is built once and keyed by [`CommandTag`]; a failing or
//! panicking handler produces an error response and never takes the
//! connection down.

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, error, warn};
use shared::{Command, CommandTag, Envelope, ErrorKind, GameView, Response};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use crate::connection_registry::ConnectionId;
use crate::coordinator::Coordinator;
use crate::error::{LobbyError, Result};

/// Response type used when a frame is too broken to carry a tag.
pub const UNKNOWN_TAG: &str = "unknown";

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        command: Command,
    ) -> Result<GameView>;
}

fn mismatched(command: &Command) -> LobbyError {
    LobbyError::Other(format!("no handler accepts {}", command.tag()))
}

pub struct CreateGame;

#[async_trait]
impl CommandHandler for CreateGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        command: Command,
    ) -> Result<GameView> {
        match command {
            Command::CreateGame { username } => coordinator.create_game(conn, &username).await,
            other => Err(mismatched(&other)),
        }
    }
}

pub struct JoinGame;

#[async_trait]
impl CommandHandler for JoinGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        command: Command,
    ) -> Result<GameView> {
        match command {
            Command::JoinGame { username, code } => {
                coordinator.join_game(conn, &username, &code).await
            }
            other => Err(mismatched(&other)),
        }
    }
}

pub struct LeaveGame;

#[async_trait]
impl CommandHandler for LeaveGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        _command: Command,
    ) -> Result<GameView> {
        coordinator.leave_game(conn).await
    }
}

pub struct DestroyGame;

#[async_trait]
impl CommandHandler for DestroyGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        _command: Command,
    ) -> Result<GameView> {
        coordinator.destroy_game(conn).await
    }
}

pub struct StartGame;

#[async_trait]
impl CommandHandler for StartGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        _command: Command,
    ) -> Result<GameView> {
        coordinator.start_game(conn).await
    }
}

pub struct StopGame;

#[async_trait]
impl CommandHandler for StopGame {
    async fn handle(
        &self,
        coordinator: &mut Coordinator,
        conn: ConnectionId,
        _command: Command,
    ) -> Result<GameView> {
        coordinator.stop_game(conn).await
    }
}

pub struct Router {
    handlers: HashMap<CommandTag, Box<dyn CommandHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A router with one handler for every command tag.
    pub fn with_default_handlers() -> Self {
        let mut router = Self::new();
        router.register(CommandTag::CreateGame, CreateGame);
        router.register(CommandTag::JoinGame, JoinGame);
        router.register(CommandTag::LeaveGame, LeaveGame);
        router.register(CommandTag::DestroyGame, DestroyGame);
        router.register(CommandTag::StartGame, StartGame);
        router.register(CommandTag::StopGame, StopGame);
        router
    }

    pub fn register(&mut self, tag: CommandTag, handler: impl CommandHandler + 'static) {
        if self.handlers.insert(tag, Box::new(handler)).is_some() {
            warn!("Handler for {} replaced", tag);
        }
    }

    /// Best-effort tag of a raw frame, for echoing in responses.
    pub fn tag_of(text: &str) -> String {
        Envelope::parse(text)
            .map(|envelope| envelope.kind)
            .unwrap_or_else(|_| UNKNOWN_TAG.to_string())
    }

    pub fn unavailable(kind: impl Into<String>) -> Response {
        Response::failure(kind, ErrorKind::Other, "the lobby is not accepting commands")
    }

    pub async fn route(&self, coordinator: &mut Coordinator, conn: ConnectionId, text: &str) -> Response {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed frame from connection {}: {}", conn, e);
                return Response::failure(UNKNOWN_TAG, e.kind(), e.to_string());
            }
        };

        let command = match Command::decode(&envelope) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    "Rejected {} from connection {}: {}",
                    envelope.kind, conn, e
                );
                return Response::failure(envelope.kind, e.kind(), e.to_string());
            }
        };

        let tag = command.tag();
        let handler = match self.handlers.get(&tag) {
            Some(handler) => handler,
            None => {
                warn!("No handler registered for {}", tag);
                return Response::failure(tag.as_str(), ErrorKind::Other, "command not supported");
            }
        };

        debug!("Connection {} -> {}", conn, tag);
        let outcome = AssertUnwindSafe(handler.handle(coordinator, conn, command))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(view)) => Response::success(tag.as_str(), view),
            Ok(Err(e)) => {
                match e.kind() {
                    ErrorKind::Other => error!("{} failed for connection {}: {}", tag, conn, e),
                    _ => debug!("{} refused for connection {}: {}", tag, conn, e),
                }
                Response::failure(tag.as_str(), e.kind(), e.to_string())
            }
            Err(_) => {
                error!("Handler for {} panicked on connection {}", tag, conn);
                Response::failure(tag.as_str(), ErrorKind::Other, "internal error")
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}
