//! Durable record storage behind the persistence gateway
//!
//! The gateway only relies on per-record insert/find/update/delete keyed by
//! id plus a filtered participant count. Two engines are provided:
//! - [`MemoryStore`] keeps everything in process memory
//! - [`FileStore`] additionally snapshots every mutation to disk with bincode

mod file;
mod memory;
#[cfg(test)]
pub(crate) mod testing;

pub use file::FileStore;
pub use memory::{MemoryStore, Snapshot};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A persisted lobby. `active` is false while players gather in the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub code: String,
    pub location: String,
    pub participant_ids: Vec<ParticipantId>,
    pub active: bool,
}

impl SessionRecord {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: SessionId::generate(),
            code: code.into(),
            location: String::new(),
            participant_ids: Vec::new(),
            active: false,
        }
    }
}

/// A persisted player membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub session: SessionId,
    pub username: String,
    pub role: String,
    pub is_spy: bool,
}

impl ParticipantRecord {
    pub fn new(session: SessionId, username: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::generate(),
            session,
            username: username.into(),
            role: shared::DEFAULT_ROLE.to_string(),
            is_spy: false,
        }
    }
}

/// Fields to overwrite on a session; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub location: Option<String>,
    pub active: Option<bool>,
    pub participant_ids: Option<Vec<ParticipantId>>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.active.is_none() && self.participant_ids.is_none()
    }

    pub(crate) fn apply(self, record: &mut SessionRecord) {
        if let Some(location) = self.location {
            record.location = location;
        }
        if let Some(active) = self.active {
            record.active = active;
        }
        if let Some(ids) = self.participant_ids {
            record.participant_ids = ids;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantPatch {
    pub username: Option<String>,
    pub role: Option<String>,
    pub is_spy: Option<bool>,
}

impl ParticipantPatch {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.role.is_none() && self.is_spy.is_none()
    }

    pub(crate) fn apply(self, record: &mut ParticipantRecord) {
        if let Some(username) = self.username {
            record.username = username;
        }
        if let Some(role) = self.role {
            record.role = role;
        }
        if let Some(is_spy) = self.is_spy {
            record.is_spy = is_spy;
        }
    }
}

/// Filter for [`Store::count_participants`]; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantFilter {
    pub session: Option<SessionId>,
    pub username: Option<String>,
}

impl ParticipantFilter {
    pub fn matches(&self, record: &ParticipantRecord) -> bool {
        self.session.map_or(true, |s| s == record.session)
            && self
                .username
                .as_deref()
                .map_or(true, |u| u == record.username)
    }
}

/// Storage engine seam. Every call is independent; nothing here is atomic
/// across records.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError>;
    async fn find_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;
    async fn update_session(&self, id: SessionId, patch: SessionPatch) -> Result<(), StoreError>;
    /// Returns false when no such record existed.
    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError>;
    /// Full scan, used only to rebuild the code cache at startup.
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<(), StoreError>;
    async fn find_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, StoreError>;
    async fn update_participant(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> Result<(), StoreError>;
    async fn delete_participant(&self, id: ParticipantId) -> Result<bool, StoreError>;
    async fn delete_participants_of(&self, session: SessionId) -> Result<u64, StoreError>;
    async fn count_participants(&self, filter: ParticipantFilter) -> Result<u64, StoreError>;
}
