// Document state store: authoritative in-memory content and version per document

use crate::error::SyncError;
use async_trait::async_trait;
use ot::{Operation, SessionId};
use protocol::AcceptedOperation;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A document being collaboratively edited
#[derive(Debug)]
pub struct Document {
    /// Document ID
    pub id: String,

    /// Current content
    content: String,

    /// Version of `content`; number of operations accepted since version 0
    version: u64,

    /// Sessions currently attached
    sessions: HashSet<SessionId>,

    /// Most recently accepted operations, oldest first
    recent: VecDeque<AcceptedOperation>,

    /// Capacity of `recent`
    history_window: usize,

    /// Version at which this document was last written to durable storage
    persisted_version: u64,
}

/// Content and version at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub version: u64,
    pub sessions: usize,
}

/// Result of a successful apply; enough to undo it
#[derive(Debug, Clone)]
pub struct Applied {
    pub accepted: AcceptedOperation,
    pub removed: String,
}

impl Document {
    /// Create a document at `version` with `content` (from a snapshot or version 0)
    pub fn new(id: impl Into<String>, content: String, version: u64, history_window: usize) -> Self {
        Document {
            id: id.into(),
            content,
            version,
            sessions: HashSet::new(),
            recent: VecDeque::new(),
            history_window,
            persisted_version: version,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn persisted_version(&self) -> u64 {
        self.persisted_version
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content.clone(),
            version: self.version,
            sessions: self.sessions.len(),
        }
    }

    /// Replay an operation read back from the log during recovery.
    ///
    /// The entry must carry the next version; anything else means the log has a gap.
    pub fn replay(&mut self, entry: AcceptedOperation) -> Result<(), SyncError> {
        if entry.version != self.version + 1 {
            return Err(SyncError::persistence(anyhow::anyhow!(
                "log for {} jumps from version {} to {}",
                self.id,
                self.version,
                entry.version
            )));
        }
        ot::apply(&mut self.content, &entry.operation)?;
        self.version = entry.version;
        self.remember(entry);
        Ok(())
    }

    /// Splice an operation that is already rebased onto the current version.
    pub fn apply_accepted(
        &mut self,
        operation: &Operation,
        user_id: &str,
    ) -> Result<Applied, SyncError> {
        if operation.base_version != self.version {
            return Err(SyncError::StaleOperation {
                base: operation.base_version,
                current: self.version,
            });
        }

        let removed = ot::apply(&mut self.content, operation)?;
        self.version += 1;

        let accepted = AcceptedOperation {
            version: self.version,
            operation: operation.clone(),
            user_id: user_id.to_string(),
            timestamp: chrono::Utc::now(),
        };
        self.remember(accepted.clone());

        Ok(Applied { accepted, removed })
    }

    /// Undo the most recent apply
    pub fn rollback(&mut self, applied: &Applied) -> Result<(), SyncError> {
        if applied.accepted.version != self.version {
            return Err(SyncError::StaleOperation {
                base: applied.accepted.version,
                current: self.version,
            });
        }

        ot::revert(&mut self.content, &applied.accepted.operation, &applied.removed)?;
        self.version -= 1;
        if self.recent.back().map(|op| op.version) == Some(applied.accepted.version) {
            self.recent.pop_back();
        }

        tracing::warn!(
            "Rolled back document {} to version {}",
            self.id,
            self.version
        );
        Ok(())
    }

    /// Operations accepted after `base`, if the recent buffer still holds all of them
    pub fn ops_since(&self, base: u64) -> Option<Vec<AcceptedOperation>> {
        if base >= self.version {
            return Some(Vec::new());
        }
        let oldest = self.recent.front()?.version;
        if oldest > base + 1 {
            return None;
        }
        Some(
            self.recent
                .iter()
                .filter(|op| op.version > base)
                .cloned()
                .collect(),
        )
    }

    pub fn mark_persisted(&mut self, version: u64) {
        self.persisted_version = self.persisted_version.max(version);
    }

    fn remember(&mut self, accepted: AcceptedOperation) {
        if self.history_window == 0 {
            return;
        }
        if self.recent.len() == self.history_window {
            self.recent.pop_front();
        }
        self.recent.push_back(accepted);
    }
}

/// Shared document state wrapped in Arc<RwLock<>> for concurrent access
pub type SharedDocument = Arc<RwLock<Document>>;

/// Access to the authoritative document state.
///
/// `apply_accepted` and `rollback` are only called from inside the
/// gateway's per-document exclusive region.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn contains(&self, doc_id: &str) -> bool;

    /// Install a recovered document; an already loaded one wins.
    async fn insert(&self, document: Document);

    async fn evict(&self, doc_id: &str) -> Option<Document>;

    async fn snapshot(&self, doc_id: &str) -> Result<Snapshot, SyncError>;

    async fn ops_since(
        &self,
        doc_id: &str,
        base: u64,
    ) -> Result<Option<Vec<AcceptedOperation>>, SyncError>;

    async fn apply_accepted(
        &self,
        doc_id: &str,
        operation: &Operation,
        user_id: &str,
    ) -> Result<Applied, SyncError>;

    async fn rollback(&self, doc_id: &str, applied: &Applied) -> Result<(), SyncError>;

    async fn mark_persisted(&self, doc_id: &str, version: u64) -> Result<(), SyncError>;

    async fn persisted_version(&self, doc_id: &str) -> Result<u64, SyncError>;

    async fn attach_session(&self, doc_id: &str, session_id: SessionId) -> Result<(), SyncError>;

    async fn detach_session(&self, doc_id: &str, session_id: SessionId) -> Result<(), SyncError>;
}

/// In-memory state store; one lock per document, none shared between documents
#[derive(Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<String, SharedDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, doc_id: &str) -> Result<SharedDocument, SyncError> {
        self.documents
            .read()
            .await
            .get(doc_id)
            .cloned()
            .ok_or_else(|| SyncError::NotLoaded(doc_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl StateStore for DocumentStore {
    async fn contains(&self, doc_id: &str) -> bool {
        self.documents.read().await.contains_key(doc_id)
    }

    async fn insert(&self, document: Document) {
        let mut documents = self.documents.write().await;
        documents
            .entry(document.id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(document)));
    }

    async fn evict(&self, doc_id: &str) -> Option<Document> {
        let shared = self.documents.write().await.remove(doc_id)?;
        match Arc::try_unwrap(shared) {
            Ok(lock) => Some(lock.into_inner()),
            Err(_) => None,
        }
    }

    async fn snapshot(&self, doc_id: &str) -> Result<Snapshot, SyncError> {
        Ok(self.get(doc_id).await?.read().await.snapshot())
    }

    async fn ops_since(
        &self,
        doc_id: &str,
        base: u64,
    ) -> Result<Option<Vec<AcceptedOperation>>, SyncError> {
        Ok(self.get(doc_id).await?.read().await.ops_since(base))
    }

    async fn apply_accepted(
        &self,
        doc_id: &str,
        operation: &Operation,
        user_id: &str,
    ) -> Result<Applied, SyncError> {
        let doc = self.get(doc_id).await?;
        let mut doc = doc.write().await;
        doc.apply_accepted(operation, user_id)
    }

    async fn rollback(&self, doc_id: &str, applied: &Applied) -> Result<(), SyncError> {
        let doc = self.get(doc_id).await?;
        let mut doc = doc.write().await;
        doc.rollback(applied)
    }

    async fn mark_persisted(&self, doc_id: &str, version: u64) -> Result<(), SyncError> {
        self.get(doc_id).await?.write().await.mark_persisted(version);
        Ok(())
    }

    async fn persisted_version(&self, doc_id: &str) -> Result<u64, SyncError> {
        Ok(self.get(doc_id).await?.read().await.persisted_version())
    }

    async fn attach_session(&self, doc_id: &str, session_id: SessionId) -> Result<(), SyncError> {
        self.get(doc_id).await?.write().await.sessions.insert(session_id);
        Ok(())
    }

    async fn detach_session(&self, doc_id: &str, session_id: SessionId) -> Result<(), SyncError> {
        self.get(doc_id).await?.write().await.sessions.remove(&session_id);
        Ok(())
    }
}
