use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    ParticipantFilter, ParticipantId, ParticipantPatch, ParticipantRecord, SessionId,
    SessionPatch, SessionRecord, Store,
};
use crate::error::StoreError;

/// Point-in-time copy of every record, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sessions: Vec<SessionRecord>,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    participants: HashMap<ParticipantId, ParticipantRecord>,
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            sessions: snapshot
                .sessions
                .into_iter()
                .map(|s| (s.id, s))
                .collect(),
            participants: snapshot
                .participants
                .into_iter()
                .map(|p| (p.id, p))
                .collect(),
        }
    }
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tables: RwLock::new(Tables::from(snapshot)),
        }
    }

    /// Replaces every record with the contents of `snapshot`.
    pub async fn replace(&self, snapshot: Snapshot) {
        *self.tables.write().await = Tables::from(snapshot);
    }

    pub async fn snapshot(&self) -> Snapshot {
        let tables = self.tables.read().await;
        let mut sessions: Vec<SessionRecord> = tables.sessions.values().cloned().collect();
        let mut participants: Vec<ParticipantRecord> =
            tables.participants.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        participants.sort_by_key(|p| p.id);
        Snapshot {
            sessions,
            participants,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id.to_string()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn update_session(&self, id: SessionId, patch: SessionPatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        patch.apply(record);
        Ok(())
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.sessions.remove(&id).is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.snapshot().await.sessions)
    }

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.participants.contains_key(&participant.id) {
            return Err(StoreError::Duplicate(participant.id.to_string()));
        }
        tables
            .participants
            .insert(participant.id, participant.clone());
        Ok(())
    }

    async fn find_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        Ok(self.tables.read().await.participants.get(&id).cloned())
    }

    async fn update_participant(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .participants
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        patch.apply(record);
        Ok(())
    }

    async fn delete_participant(&self, id: ParticipantId) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.participants.remove(&id).is_some())
    }

    async fn delete_participants_of(&self, session: SessionId) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.participants.len();
        tables.participants.retain(|_, p| p.session != session);
        Ok((before - tables.participants.len()) as u64)
    }

    async fn count_participants(&self, filter: ParticipantFilter) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .participants
            .values()
            .filter(|p| filter.matches(p))
            .count() as u64)
    }
}
