use async_trait::async_trait;
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{
    MemoryStore, ParticipantFilter, ParticipantId, ParticipantPatch, ParticipantRecord,
    SessionId, SessionPatch, SessionRecord, Snapshot, Store,
};
use crate::error::StoreError;

/// [`MemoryStore`] that writes a bincode snapshot to disk after every
/// mutation. The file is replaced atomically through a temporary sibling.
/// A mutation whose snapshot cannot be written is undone in memory too.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the snapshot at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = bincode::deserialize(&bytes)?;
                info!(
                    "Loaded {} sessions and {} participants from {}",
                    snapshot.sessions.len(),
                    snapshot.participants.len(),
                    path.display()
                );
                MemoryStore::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
                MemoryStore::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.snapshot().await
    }

    /// Writes the current records to disk, or rolls them back to `before`.
    ///
    /// Callers hold `write_lock` from before their change to `inner` until
    /// this returns, so a failed write never leaves a change visible that
    /// the file does not have.
    async fn commit(&self, before: Snapshot) -> Result<(), StoreError> {
        match self.write_snapshot().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "Snapshot write to {} failed, rolling back: {}",
                    self.path.display(),
                    e
                );
                self.inner.replace(before).await;
                Err(e)
            }
        }
    }

    async fn write_snapshot(&self) -> Result<(), StoreError> {
        let bytes = bincode::serialize(&self.inner.snapshot().await)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Wrote {} byte snapshot to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.insert_session(session).await?;
        self.commit(before).await
    }

    async fn find_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.find_session(id).await
    }

    async fn update_session(&self, id: SessionId, patch: SessionPatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.update_session(id, patch).await?;
        self.commit(before).await
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        let removed = self.inner.delete_session(id).await?;
        if removed {
            self.commit(before).await?;
        }
        Ok(removed)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.list_sessions().await
    }

    async fn insert_participant(&self, participant: &ParticipantRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.insert_participant(participant).await?;
        self.commit(before).await
    }

    async fn find_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        self.inner.find_participant(id).await
    }

    async fn update_participant(
        &self,
        id: ParticipantId,
        patch: ParticipantPatch,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        self.inner.update_participant(id, patch).await?;
        self.commit(before).await
    }

    async fn delete_participant(&self, id: ParticipantId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        let removed = self.inner.delete_participant(id).await?;
        if removed {
            self.commit(before).await?;
        }
        Ok(removed)
    }

    async fn delete_participants_of(&self, session: SessionId) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.inner.snapshot().await;
        let removed = self.inner.delete_participants_of(session).await?;
        if removed > 0 {
            self.commit(before).await?;
        }
        Ok(removed)
    }

    async fn count_participants(&self, filter: ParticipantFilter) -> Result<u64, StoreError> {
        self.inner.count_participants(filter).await
    }
}
