//! Error types for the store boundary and the session coordinator.

use shared::{ErrorKind, ProtocolError};
use std::time::Duration;
use thiserror::Error;

use crate::store::{ParticipantId, SessionId};

/// Failures reported by a [`crate::store::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("record {0} does not exist")]
    Missing(String),
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot could not be encoded: {0}")]
    Codec(#[from] bincode::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything that can go wrong while serving a command.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("game '{0}' was not found. Is the game code correct?")]
    UnknownCode(String),
    #[error("game {0} was not found in the store")]
    SessionNotFound(SessionId),
    #[error("this connection already belongs to game '{0}'")]
    AlreadyInSession(String),
    #[error("cannot join a game that is currently in progress")]
    SessionInProgress,
    #[error("the game has not been started")]
    SessionNotInProgress,
    #[error("player with the username {username} already exists in game {code}")]
    UsernameTaken { username: String, code: String },
    #[error("player {0} was not found")]
    ParticipantNotFound(ParticipantId),
    #[error("this connection has not joined a game")]
    NotJoined,
    #[error("this connection is not part of any game")]
    NotInSession,
    #[error("the store did not answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A participant was inserted but could not be linked to its session.
    #[error("participant {participant} was left without a session: {source}")]
    Orphaned {
        participant: ParticipantId,
        #[source]
        source: Box<LobbyError>,
    },
    #[error("{0}")]
    Other(String),
}

impl LobbyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LobbyError::Protocol(e) => e.kind(),
            LobbyError::UnknownCode(_)
            | LobbyError::SessionNotFound(_)
            | LobbyError::NotInSession => ErrorKind::SessionNotFound,
            LobbyError::AlreadyInSession(_) => ErrorKind::SessionExists,
            LobbyError::SessionInProgress => ErrorKind::SessionInProgress,
            LobbyError::SessionNotInProgress => ErrorKind::SessionNotInProgress,
            LobbyError::UsernameTaken { .. } => ErrorKind::UsernameTaken,
            LobbyError::ParticipantNotFound(_) | LobbyError::NotJoined => {
                ErrorKind::ParticipantNotFound
            }
            LobbyError::Timeout(_)
            | LobbyError::Store(_)
            | LobbyError::Orphaned { .. }
            | LobbyError::Other(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T, E = LobbyError> = std::result::Result<T, E>;
