// Operation log: append-only, version-ordered history per document

use crate::error::SyncError;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use protocol::AcceptedOperation;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Entries fetched per page when streaming history
pub const PAGE_SIZE: usize = 128;

/// Lazy, finite sequence of accepted operations in version order
pub type OperationStream = BoxStream<'static, Result<AcceptedOperation, SyncError>>;

#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Record an accepted operation.
    ///
    /// Fails if `entry.version` is already recorded or is not the next
    /// version after the latest one, so no two entries share a version.
    async fn append(&self, doc_id: &str, entry: &AcceptedOperation) -> Result<(), SyncError>;

    /// Operations with version greater than `from`, oldest first.
    ///
    /// Every call starts a fresh read, so a dropped stream can be restarted
    /// from the last version it produced.
    fn read_since(&self, doc_id: &str, from: u64) -> OperationStream;

    /// Highest recorded version, 0 for an unknown document
    async fn latest_version(&self, doc_id: &str) -> Result<u64, SyncError>;

    /// Drop entries with version <= `through`; returns how many were removed
    async fn compact(&self, doc_id: &str, through: u64) -> Result<u64, SyncError>;

    /// Highest version removed by compaction, 0 if never compacted
    async fn compacted_through(&self, doc_id: &str) -> Result<u64, SyncError>;
}

/// Build a paged stream from a page fetcher.
///
/// `fetch(cursor)` returns up to `PAGE_SIZE` entries with version > cursor.
pub fn paged<F, Fut>(from: u64, fetch: F) -> OperationStream
where
    F: Fn(u64) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<AcceptedOperation>, SyncError>> + Send + 'static,
{
    stream::try_unfold((from, false), move |(cursor, exhausted)| {
        let page = (!exhausted).then(|| fetch(cursor));
        async move {
            let Some(page) = page else {
                return Ok::<_, SyncError>(None);
            };
            let page = page.await?;
            let Some(last) = page.last().map(|entry| entry.version) else {
                return Ok(None);
            };
            let exhausted = page.len() < PAGE_SIZE;
            let entries = stream::iter(page.into_iter().map(Ok::<_, SyncError>));
            Ok(Some((entries, (last, exhausted))))
        }
    })
    .try_flatten()
    .boxed()
}

#[derive(Debug, Default)]
struct DocLog {
    entries: Vec<AcceptedOperation>,
    compacted_through: u64,
}

impl DocLog {
    fn latest(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.version)
            .unwrap_or(self.compacted_through)
    }
}

/// In-process log, used in tests and when running without a database
#[derive(Clone, Default)]
pub struct MemoryLog {
    docs: Arc<RwLock<HashMap<String, DocLog>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationLog for MemoryLog {
    async fn append(&self, doc_id: &str, entry: &AcceptedOperation) -> Result<(), SyncError> {
        let mut docs = self.docs.write().await;
        let log = docs.entry(doc_id.to_string()).or_default();

        let expected = log.latest() + 1;
        if entry.version != expected {
            return Err(SyncError::persistence(anyhow::anyhow!(
                "cannot record version {} for {doc_id}, next is {expected}",
                entry.version
            )));
        }

        log.entries.push(entry.clone());
        Ok(())
    }

    fn read_since(&self, doc_id: &str, from: u64) -> OperationStream {
        let docs = self.docs.clone();
        let doc_id = doc_id.to_string();

        paged(from, move |cursor| {
            let docs = docs.clone();
            let doc_id = doc_id.clone();
            async move {
                let docs = docs.read().await;
                Ok(docs
                    .get(&doc_id)
                    .map(|log| {
                        log.entries
                            .iter()
                            .filter(|entry| entry.version > cursor)
                            .take(PAGE_SIZE)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            }
        })
    }

    async fn latest_version(&self, doc_id: &str) -> Result<u64, SyncError> {
        Ok(self
            .docs
            .read()
            .await
            .get(doc_id)
            .map(DocLog::latest)
            .unwrap_or(0))
    }

    async fn compact(&self, doc_id: &str, through: u64) -> Result<u64, SyncError> {
        let mut docs = self.docs.write().await;
        let Some(log) = docs.get_mut(doc_id) else {
            return Ok(0);
        };

        let through = through.min(log.latest());
        let before = log.entries.len();
        log.entries.retain(|entry| entry.version > through);
        log.compacted_through = log.compacted_through.max(through);
        Ok((before - log.entries.len()) as u64)
    }

    async fn compacted_through(&self, doc_id: &str) -> Result<u64, SyncError> {
        Ok(self
            .docs
            .read()
            .await
            .get(doc_id)
            .map(|log| log.compacted_through)
            .unwrap_or(0))
    }
}
