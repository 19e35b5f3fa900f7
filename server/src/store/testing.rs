//! Fault-injecting store used by gateway and coordinator tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    MemoryStore, ParticipantFilter, ParticipantId, ParticipantPatch, ParticipantRecord,
    SessionId, SessionPatch, SessionRecord, Snapshot, Store,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_session_updates: AtomicBool,
    fail_participant_inserts: AtomicBool,
    delay: Mutex<Option<Duration>>,
    insert_ack_delay: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_session_updates(&self, fail: bool) {
        self.fail_session_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_participant_inserts(&self, fail: bool) {
        self.fail_participant_inserts.store(fail, Ordering::SeqCst);
    }

    /// Every call sleeps this long before touching the tables.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.delay.lock() {
            *guard = delay;
        }
    }

    /// Session inserts are applied at once but acknowledged this much later.
    pub fn set_insert_ack_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.insert_ack_delay.lock() {
            *guard = delay;
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.snapshot().await
    }

    async fn stall(&self) {
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.stall().await;
        self.inner.insert_session(session).await?;
        let ack_delay = self.insert_ack_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn find_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.stall().await;
        self.inner.find_session(id).await
    }

    async fn update_session(&self, id: SessionId, patch: SessionPatch) -> Result<(), StoreError> {
        self.stall().await;
        if self.fail_session_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("session update rejected".into()));
        }
        self.inner.update_session(id, patch).await
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError> {
        self.stall().await;
        self.inner.delete_session(id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.list_sessions().await
    }

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<(), StoreError> {
        self.stall().await;
        if self.fail_participant_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("participant insert rejected".into()));
        }
        self.inner.insert_participant(participant).await
    }

    async fn find_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        self.stall().await;
        self.inner.find_participant(id).await
    }

    async fn update_participant(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> Result<(), StoreError> {
        self.stall().await;
        self.inner.update_participant(id, patch).await
    }

    async fn delete_participant(&self, id: ParticipantId) -> Result<bool, StoreError> {
        self.stall().await;
        self.inner.delete_participant(id).await
    }

    async fn delete_participants_of(&self, session: SessionId) -> Result<u64, StoreError> {
        self.stall().await;
        self.inner.delete_participants_of(session).await
    }

    async fn count_participants(&self, filter: ParticipantFilter) -> Result<u64, StoreError> {
        self.stall().await;
        self.inner.count_participants(filter).await
    }
}
