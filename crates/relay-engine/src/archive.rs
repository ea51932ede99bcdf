use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::info;

use relay_core::ids::SessionId;
use relay_store::{RemoteStore, StoreError, SyncedDatabase, WriterPriorityLock};

use crate::adaptive::AdaptiveState;
use crate::error::EngineError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS adaptive_state (
    session_id TEXT PRIMARY KEY,
    state      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";

/// Last known adaptive state per session, kept in a [`SyncedDatabase`] so it
/// survives restarts when a remote store is configured.
pub struct StateArchive {
    db: SyncedDatabase<WriterPriorityLock>,
}

impl StateArchive {
    pub fn open(path: &Path, remote: Option<Arc<dyn RemoteStore>>) -> Result<Self, EngineError> {
        Self::init(SyncedDatabase::open(path, remote, WriterPriorityLock::new())?)
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        Self::init(SyncedDatabase::in_memory(WriterPriorityLock::new())?)
    }

    fn init(db: SyncedDatabase<WriterPriorityLock>) -> Result<Self, EngineError> {
        db.execute(|conn| Ok(conn.execute_batch(SCHEMA)?))?;
        info!(path = %db.path().display(), "adaptive state archive ready");
        Ok(Self { db })
    }

    pub async fn save(&self, session_id: &SessionId, state: &AdaptiveState) -> Result<(), EngineError> {
        let raw = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        self.db
            .execute_async(|conn| {
                conn.execute(
                    "INSERT INTO adaptive_state (session_id, state, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(session_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                    params![session_id.as_str(), raw, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load(&self, session_id: &SessionId) -> Result<Option<AdaptiveState>, EngineError> {
        let raw: Option<String> = self
            .db
            .query_async(|conn| {
                conn.query_row(
                    "SELECT state FROM adaptive_state WHERE session_id = ?1",
                    params![session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;
        Ok(raw.map(|r| serde_json::from_str::<AdaptiveState>(&r)).transpose()?)
    }

    pub async fn delete(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        let removed = self
            .db
            .execute_async(|conn| {
                Ok(conn.execute(
                    "DELETE FROM adaptive_state WHERE session_id = ?1",
                    params![session_id.as_str()],
                )?)
            })
            .await?;
        Ok(removed > 0)
    }

    pub async fn clear(&self) -> Result<usize, EngineError> {
        Ok(self
            .db
            .execute_async(|conn| Ok(conn.execute("DELETE FROM adaptive_state", [])?))
            .await?)
    }

    /// Push to the remote store if anything changed.
    pub async fn sync(&self) -> Result<bool, EngineError> {
        Ok(self.db.sync_async().await?)
    }

    pub fn close(self) -> Result<bool, EngineError> {
        Ok(self.db.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::LocalDirStore;

    #[tokio::test]
    async fn save_load_and_delete() {
        let archive = StateArchive::in_memory().unwrap();
        let id: SessionId = "sess_1".into();
        assert!(archive.load(&id).await.unwrap().is_none());

        let mut state = AdaptiveState::initial("fast");
        state.turn_count = 3;
        archive.save(&id, &state).await.unwrap();
        state.think_mode = true;
        archive.save(&id, &state).await.unwrap();

        assert_eq!(archive.load(&id).await.unwrap(), Some(state));
        assert!(archive.delete(&id).await.unwrap());
        assert!(!archive.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_reopen_through_remote() {
        let remote_dir = tempfile::tempdir().unwrap();
        let local_a = tempfile::tempdir().unwrap();
        let local_b = tempfile::tempdir().unwrap();
        let remote: Arc<dyn RemoteStore> = Arc::new(LocalDirStore::new(remote_dir.path()));

        let archive = StateArchive::open(&local_a.path().join("state.db"), Some(Arc::clone(&remote))).unwrap();
        archive.save(&"s".into(), &AdaptiveState::initial("fast")).await.unwrap();
        assert!(archive.close().unwrap());

        let reopened = StateArchive::open(&local_b.path().join("state.db"), Some(remote)).unwrap();
        let state = reopened.load(&"s".into()).await.unwrap().expect("restored");
        assert_eq!(state.current_model, "fast");
        assert_eq!(reopened.clear().await.unwrap(), 1);
    }
}
