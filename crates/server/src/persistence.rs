// Durable document checkpoints

use crate::database::Database;
use crate::error::SyncError;
use crate::file_store::{FileStore, StoredSnapshot};
use async_trait::async_trait;

/// Content at a known version, from which the log is replayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub content: String,
    pub version: u64,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Latest durable state of a document, None if nothing was ever stored
    async fn load_document(&self, doc_id: &str) -> Result<Option<Checkpoint>, SyncError>;

    async fn persist_snapshot(
        &self,
        doc_id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), SyncError>;
}

#[async_trait]
impl Persistence for FileStore {
    async fn load_document(&self, doc_id: &str) -> Result<Option<Checkpoint>, SyncError> {
        let snapshot = self
            .load_snapshot(doc_id)
            .await
            .map_err(SyncError::persistence)?;

        Ok(snapshot.map(|snapshot| Checkpoint {
            content: snapshot.content,
            version: snapshot.version,
        }))
    }

    async fn persist_snapshot(
        &self,
        doc_id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), SyncError> {
        self.save_snapshot(&StoredSnapshot {
            doc_id: doc_id.to_string(),
            content: content.to_string(),
            version,
            updated_at: chrono::Utc::now(),
        })
        .await
        .map_err(SyncError::persistence)
    }
}

/// Snapshot files backed by the notes table.
///
/// A note that was never checkpointed starts from its stored content at
/// version 0. Checkpoints only go to files: the note row stays the base
/// the log replays onto.
pub struct Storage {
    files: FileStore,
    notes: Option<Database>,
}

impl Storage {
    pub fn new(files: FileStore, notes: Option<Database>) -> Self {
        Storage { files, notes }
    }
}

#[async_trait]
impl Persistence for Storage {
    async fn load_document(&self, doc_id: &str) -> Result<Option<Checkpoint>, SyncError> {
        if let Some(checkpoint) = self.files.load_document(doc_id).await? {
            return Ok(Some(checkpoint));
        }

        let Some(db) = &self.notes else {
            return Ok(None);
        };

        let content = db
            .load_note_content(doc_id)
            .await
            .map_err(SyncError::persistence)?;
        Ok(content.map(|content| Checkpoint {
            content,
            version: 0,
        }))
    }

    async fn persist_snapshot(
        &self,
        doc_id: &str,
        content: &str,
        version: u64,
    ) -> Result<(), SyncError> {
        self.files.persist_snapshot(doc_id, content, version).await
    }
}
