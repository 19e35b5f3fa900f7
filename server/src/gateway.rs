//! Persistence gateway: session and participant CRUD over a [`Store`]
//!
//! The gateway is the only writer of the code cache, so a code is registered
//! exactly when its session has been inserted and unregistered exactly when
//! it has been deleted. Every store call is bounded by a timeout; cache
//! changes are applied only after the store confirmed the write.

use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::codes::CodeRegistry;
use crate::error::{LobbyError, Result, StoreError};
use crate::store::{
    ParticipantFilter, ParticipantId, ParticipantPatch, ParticipantRecord, SessionId,
    SessionPatch, SessionRecord, Store,
};

/// Desired session fields; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub id: Option<SessionId>,
    pub location: Option<String>,
    pub active: Option<bool>,
    pub participant_ids: Option<Vec<ParticipantId>>,
}

impl SessionUpdate {
    pub fn for_session(id: SessionId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }
}

/// Desired participant fields; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantUpdate {
    pub id: Option<ParticipantId>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub is_spy: Option<bool>,
}

impl ParticipantUpdate {
    pub fn for_participant(id: ParticipantId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }
}

/// Outcome of removing a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub participant: ParticipantRecord,
    pub code: String,
    /// The participant was the last one, so the session was deleted too.
    pub session_closed: bool,
}

pub struct Gateway {
    store: Arc<dyn Store>,
    codes: CodeRegistry,
    timeout: Duration,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self {
            store,
            codes: CodeRegistry::new(),
            timeout,
        }
    }

    pub fn codes(&self) -> &CodeRegistry {
        &self.codes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LobbyError::Timeout(self.timeout)),
        }
    }

    /// Rebuilds the code cache from the stored sessions.
    pub async fn restore(&mut self) -> Result<usize> {
        let sessions = self.bounded(self.store.list_sessions()).await?;
        self.codes.clear();
        for session in &sessions {
            self.codes.register(&session.code, session.id);
        }
        info!("Restored {} game codes from the store", sessions.len());
        Ok(sessions.len())
    }

    pub fn resolve(&self, code: &str) -> Result<SessionId> {
        self.codes
            .resolve(code)
            .ok_or_else(|| LobbyError::UnknownCode(code.to_string()))
    }

    pub async fn create_session(&mut self) -> Result<SessionRecord> {
        let code = self.codes.generate_unique(&mut rand::thread_rng());
        let session = SessionRecord::new(code);

        match self.bounded(self.store.insert_session(&session)).await {
            Ok(()) => {}
            Err(e @ LobbyError::Timeout(_)) => {
                // The store may still apply the insert after we gave up on it.
                match self.bounded(self.store.delete_session(session.id)).await {
                    Ok(removed) => warn!(
                        "Insert of game {} timed out, late record removed: {}",
                        session.code, removed
                    ),
                    Err(cleanup) => error!(
                        "Insert of game {} timed out and cleanup failed: {}",
                        session.code, cleanup
                    ),
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.codes.register(&session.code, session.id);

        info!("Created game {} ({})", session.code, session.id);
        Ok(session)
    }

    /// Deletes a session and every participant referencing it.
    pub async fn delete_session(&mut self, id: SessionId) -> Result<SessionRecord> {
        let session = self
            .bounded(self.store.find_session(id))
            .await?
            .ok_or(LobbyError::SessionNotFound(id))?;

        let removed = self.bounded(self.store.delete_participants_of(id)).await?;
        self.bounded(self.store.delete_session(id)).await?;
        self.codes.unregister(&session.code, id);

        info!(
            "Deleted game {} along with {} participants",
            session.code, removed
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: SessionId) -> Result<SessionRecord> {
        self.bounded(self.store.find_session(id))
            .await?
            .ok_or(LobbyError::SessionNotFound(id))
    }

    /// Writes only the fields that differ from the stored session.
    pub async fn update_session(&self, update: SessionUpdate) -> Result<SessionRecord> {
        let id = update
            .id
            .ok_or_else(|| LobbyError::Other("session update without an id".into()))?;
        let mut current = self.get_session(id).await?;

        let patch = SessionPatch {
            location: update.location.filter(|l| *l != current.location),
            active: update.active.filter(|a| *a != current.active),
            participant_ids: update
                .participant_ids
                .filter(|ids| *ids != current.participant_ids),
        };

        if patch.is_empty() {
            debug!("Game {} unchanged, skipping write", current.code);
            return Ok(current);
        }

        self.bounded(self.store.update_session(id, patch.clone()))
            .await?;
        patch.apply(&mut current);
        Ok(current)
    }

    /// Inserts a participant and appends it to its session.
    ///
    /// The two writes are not atomic. When the second one fails the error is
    /// [`LobbyError::Orphaned`] and the caller must discard the participant.
    pub async fn add_participant(
        &self,
        username: &str,
        session_id: SessionId,
    ) -> Result<ParticipantRecord> {
        let session = self.get_session(session_id).await?;

        if session.active {
            return Err(LobbyError::SessionInProgress);
        }

        self.check_username(username, &session.code).await?;

        let participant = ParticipantRecord::new(session_id, username);
        match self
            .bounded(self.store.insert_participant(&participant))
            .await
        {
            Ok(()) => {}
            // The store may still apply an insert we stopped waiting for.
            Err(source @ LobbyError::Timeout(_)) => {
                return Err(LobbyError::Orphaned {
                    participant: participant.id,
                    source: Box::new(source),
                })
            }
            Err(e) => return Err(e),
        }

        let mut ids = session.participant_ids;
        ids.push(participant.id);
        let patch = SessionPatch {
            participant_ids: Some(ids),
            ..Default::default()
        };

        if let Err(source) = self
            .bounded(self.store.update_session(session_id, patch))
            .await
        {
            return Err(LobbyError::Orphaned {
                participant: participant.id,
                source: Box::new(source),
            });
        }

        Ok(participant)
    }

    /// Removes a participant, deleting its session when it was the last one.
    pub async fn delete_participant(&mut self, id: ParticipantId) -> Result<Departure> {
        let participant = self.get_participant(id).await?;

        let session = match self
            .bounded(self.store.find_session(participant.session))
            .await?
        {
            Some(session) => session,
            None => {
                warn!(
                    "Participant {} referenced missing game {}",
                    id, participant.session
                );
                self.bounded(self.store.delete_participant(id)).await?;
                let code = self
                    .codes
                    .code_of(participant.session)
                    .unwrap_or_default()
                    .to_string();
                return Ok(Departure {
                    participant,
                    code,
                    session_closed: true,
                });
            }
        };

        let remaining: Vec<ParticipantId> = session
            .participant_ids
            .iter()
            .copied()
            .filter(|p| *p != id)
            .collect();
        let session_closed = remaining.is_empty();

        if session_closed {
            self.delete_session(session.id).await?;
        } else {
            let patch = SessionPatch {
                participant_ids: Some(remaining),
                ..Default::default()
            };
            self.bounded(self.store.update_session(session.id, patch))
                .await?;
        }

        self.bounded(self.store.delete_participant(id)).await?;

        Ok(Departure {
            participant,
            code: session.code,
            session_closed,
        })
    }

    pub async fn get_participant(&self, id: ParticipantId) -> Result<ParticipantRecord> {
        self.bounded(self.store.find_participant(id))
            .await?
            .ok_or(LobbyError::ParticipantNotFound(id))
    }

    /// Writes only the fields that differ from the stored participant.
    pub async fn update_participant(&self, update: ParticipantUpdate) -> Result<ParticipantRecord> {
        let id = update
            .id
            .ok_or_else(|| LobbyError::Other("participant update without an id".into()))?;
        let mut current = self.get_participant(id).await?;

        let patch = ParticipantPatch {
            username: update.username.filter(|u| *u != current.username),
            role: update.role.filter(|r| *r != current.role),
            is_spy: update.is_spy.filter(|s| *s != current.is_spy),
        };

        if patch.is_empty() {
            return Ok(current);
        }

        if let Some(username) = &patch.username {
            let code = self
                .codes
                .code_of(current.session)
                .ok_or(LobbyError::SessionNotFound(current.session))?
                .to_string();
            self.check_username(username, &code).await?;
        }

        self.bounded(self.store.update_participant(id, patch.clone()))
            .await?;
        patch.apply(&mut current);
        Ok(current)
    }

    /// Succeeds when nobody in the game `code` uses `username` yet.
    pub async fn check_username(&self, username: &str, code: &str) -> Result<()> {
        let session = self.resolve(code)?;
        let filter = ParticipantFilter {
            session: Some(session),
            username: Some(username.to_string()),
        };

        match self.bounded(self.store.count_participants(filter)).await? {
            0 => Ok(()),
            _ => Err(LobbyError::UsernameTaken {
                username: username.to_string(),
                code: code.to_string(),
            }),
        }
    }

    /// Deletes a participant record that never made it into its session.
    pub async fn discard_participant(&self, id: ParticipantId) -> Result<bool> {
        self.bounded(self.store.delete_participant(id)).await
    }
}
