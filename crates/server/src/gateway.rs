// Synchronization gateway: validate, rebase, apply, log and fan out client edits

use crate::auth::{NoteAccess, OpenAccess};
use crate::document::{Applied, Document, Snapshot, StateStore};
use crate::error::SyncError;
use crate::oplog::{OperationLog, OperationStream};
use crate::persistence::Persistence;
use crate::room::{Member, RoomManager};
use futures_util::TryStreamExt;
use ot::{Operation, SessionId};
use protocol::{AcceptedOperation, Collaborator, OperationRequest, ServerMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Tunables for the apply path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Snapshot-rebase-apply cycles before giving up with a conflict
    pub max_apply_attempts: usize,

    /// Checkpoint every this many versions; 0 disables periodic checkpoints
    pub snapshot_interval: u64,

    /// Drop log entries covered by a checkpoint
    pub compact_log: bool,

    /// Accepted operations kept in memory per document for rebasing
    pub history_window: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            max_apply_attempts: 3,
            snapshot_interval: 100,
            compact_log: false,
            history_window: 256,
        }
    }
}

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// One async mutex per document id. Documents never share a lock.
///
/// Entries live only while a region is held or awaited, so ids that are
/// never joined leave nothing behind.
#[derive(Default)]
struct DocLocks {
    locks: LockMap,
}

/// Exclusive region for one document; released on drop
struct Region {
    doc_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl DocLocks {
    async fn acquire(&self, doc_id: &str) -> Region {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(doc_id.to_string())
            .or_default()
            .clone();
        // Built before waiting so a cancelled wait still cleans up
        let mut region = Region {
            doc_id: doc_id.to_string(),
            guard: None,
            locks: self.locks.clone(),
        };
        region.guard = Some(lock.lock_owned().await);
        region
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Only the map holds it now: no holder, no waiter
        if locks
            .get(&self.doc_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.doc_id);
        }
    }
}

pub struct SyncGateway {
    store: Arc<dyn StateStore>,
    log: Arc<dyn OperationLog>,
    persistence: Arc<dyn Persistence>,
    access: Arc<dyn NoteAccess>,
    rooms: RoomManager,
    locks: DocLocks,
    settings: GatewaySettings,
}

/// Shared gateway handle
pub type SharedGateway = Arc<SyncGateway>;

impl SyncGateway {
    pub fn new(
        store: Arc<dyn StateStore>,
        log: Arc<dyn OperationLog>,
        persistence: Arc<dyn Persistence>,
        settings: GatewaySettings,
    ) -> Self {
        SyncGateway {
            store,
            log,
            persistence,
            access: Arc::new(OpenAccess),
            rooms: RoomManager::new(),
            locks: DocLocks::default(),
            settings,
        }
    }

    /// Check every join against `access` instead of letting anyone in
    pub fn with_access(mut self, access: Arc<dyn NoteAccess>) -> Self {
        self.access = access;
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Accept a client edit.
    ///
    /// The author must have joined the document. On success the rebased
    /// operation has been applied, logged, broadcast to the other members and
    /// acknowledged to the author, in that order.
    pub async fn submit_operation(
        &self,
        doc_id: &str,
        author: &Collaborator,
        request: &OperationRequest,
    ) -> Result<AcceptedOperation, SyncError> {
        let operation = request.to_operation(author.session_id)?;
        if !self.rooms.is_member(doc_id, author.session_id).await {
            return Err(SyncError::NotJoined(doc_id.to_string()));
        }

        let _region = self.locks.acquire(doc_id).await;
        self.ensure_loaded(doc_id).await?;

        let applied = self
            .apply_with_retry(doc_id, &operation, &author.user_id)
            .await?;

        if let Err(err) = self.log.append(doc_id, &applied.accepted).await {
            tracing::error!(
                "Failed to log v{} of {}: {}",
                applied.accepted.version,
                doc_id,
                err
            );
            if let Err(rollback_err) = self.store.rollback(doc_id, &applied).await {
                tracing::error!(
                    "Rollback of v{} of {} failed: {}",
                    applied.accepted.version,
                    doc_id,
                    rollback_err
                );
            }
            return Err(err);
        }

        let accepted = applied.accepted;
        let delivered = self
            .rooms
            .broadcast(
                doc_id,
                &ServerMessage::operation_applied(doc_id, &accepted),
                Some(author.session_id),
            )
            .await;
        self.rooms
            .send_to(
                doc_id,
                author.session_id,
                ServerMessage::Accepted {
                    doc_id: doc_id.to_string(),
                    client_seq: request.client_seq,
                    operation: accepted.clone(),
                },
            )
            .await;

        tracing::debug!(
            "Applied {} from session {} to {} as v{} (broadcast to {})",
            accepted.operation.kind,
            author.session_id,
            doc_id,
            accepted.version,
            delivered
        );

        let interval = self.settings.snapshot_interval;
        if interval > 0 && accepted.version % interval == 0 {
            if let Err(err) = self.checkpoint(doc_id).await {
                tracing::warn!("Checkpoint of {} failed: {}", doc_id, err);
            }
        }

        Ok(accepted)
    }

    async fn apply_with_retry(
        &self,
        doc_id: &str,
        operation: &Operation,
        user_id: &str,
    ) -> Result<Applied, SyncError> {
        let attempts = self.settings.max_apply_attempts.max(1);

        for attempt in 1..=attempts {
            let current = self.store.snapshot(doc_id).await?.version;
            let base = operation.base_version;
            if base > current {
                return Err(SyncError::FutureVersion { base, current });
            }

            let mut rebased = if base < current {
                let concurrent = self.concurrent_ops(doc_id, base, current).await?;
                ot::rebase(operation, concurrent.iter().map(|entry| &entry.operation))
            } else {
                operation.clone()
            };
            rebased.base_version = current;

            match self.store.apply_accepted(doc_id, &rebased, user_id).await {
                Err(SyncError::StaleOperation { base, current }) => {
                    tracing::debug!(
                        "Attempt {}/{} on {} raced (v{} vs v{}), retrying",
                        attempt,
                        attempts,
                        doc_id,
                        base,
                        current
                    );
                }
                result => return result,
            }
        }

        tracing::warn!("Giving up on {} after {} attempts", doc_id, attempts);
        Err(SyncError::Conflict { attempts })
    }

    /// Operations accepted in (base, current], from memory or else the log
    async fn concurrent_ops(
        &self,
        doc_id: &str,
        base: u64,
        current: u64,
    ) -> Result<Vec<AcceptedOperation>, SyncError> {
        if let Some(recent) = self.store.ops_since(doc_id, base).await? {
            return Ok(recent
                .into_iter()
                .take_while(|entry| entry.version <= current)
                .collect());
        }

        let ops: Vec<AcceptedOperation> = self
            .catch_up(doc_id, base)
            .await?
            .try_take_while(|entry| futures_util::future::ready(Ok(entry.version <= current)))
            .try_collect()
            .await?;

        if ops.len() as u64 != current - base {
            return Err(SyncError::persistence(anyhow::anyhow!(
                "log for {doc_id} holds {} of the {} operations after v{base}",
                ops.len(),
                current - base
            )));
        }
        Ok(ops)
    }

    /// The catch-up stream: every accepted operation after `since`.
    ///
    /// Fails if compaction already dropped part of that range.
    pub async fn catch_up(&self, doc_id: &str, since: u64) -> Result<OperationStream, SyncError> {
        let floor = self.log.compacted_through(doc_id).await?;
        if since < floor {
            return Err(SyncError::HistoryUnavailable { base: since, floor });
        }
        Ok(self.log.read_since(doc_id, since))
    }

    /// Join a member to a document.
    ///
    /// The member's user must be allowed on the note. It receives `joined`,
    /// then either the full snapshot (no `since`, or history no longer
    /// available) or every operation after `since`, then `caught-up`. Only
    /// then is it added to the room, so catch-up always precedes live
    /// broadcasts. Returns the caught-up version.
    pub async fn subscribe(
        &self,
        doc_id: &str,
        member: Member,
        since: Option<u64>,
    ) -> Result<u64, SyncError> {
        self.access
            .authorize(&member.collaborator.user_id, doc_id)
            .await?;

        let _region = self.locks.acquire(doc_id).await;
        let loaded = self.ensure_loaded(doc_id).await?;

        let result = self.join_loaded(doc_id, member, since).await;
        if result.is_err() && loaded && !self.rooms.is_active(doc_id).await {
            // Nobody is left to unload what this join loaded
            self.store.evict(doc_id).await;
            tracing::debug!("Unloaded {} after a failed join", doc_id);
        }
        result
    }

    /// Catch a member up and add it to the room. Caller holds the region.
    async fn join_loaded(
        &self,
        doc_id: &str,
        member: Member,
        since: Option<u64>,
    ) -> Result<u64, SyncError> {
        let session_id = member.session_id();
        let sender = member.sender.clone();

        let snapshot = self.store.snapshot(doc_id).await?;
        let floor = self.log.compacted_through(doc_id).await?;

        let _ = sender.send(ServerMessage::Joined {
            doc_id: doc_id.to_string(),
            session_id,
            collaborators: self.rooms.members(doc_id).await,
        });

        match since {
            Some(since) if since >= floor && since <= snapshot.version => {
                let mut stream = self.catch_up(doc_id, since).await?;
                let mut sent = 0;
                while let Some(entry) = stream.try_next().await? {
                    if entry.version > snapshot.version {
                        break;
                    }
                    let _ = sender.send(ServerMessage::operation_applied(doc_id, &entry));
                    sent += 1;
                }
                tracing::debug!(
                    "Session {} caught up on {} from v{} ({} operations)",
                    session_id,
                    doc_id,
                    since,
                    sent
                );
            }
            _ => {
                let _ = sender.send(ServerMessage::Snapshot {
                    doc_id: doc_id.to_string(),
                    content: snapshot.content,
                    version: snapshot.version,
                });
            }
        }

        let _ = sender.send(ServerMessage::CaughtUp {
            doc_id: doc_id.to_string(),
            version: snapshot.version,
        });

        self.rooms.join(doc_id, member).await;
        self.store.attach_session(doc_id, session_id).await?;
        Ok(snapshot.version)
    }

    /// Remove a member. The last one out checkpoints and unloads the document.
    pub async fn leave(&self, doc_id: &str, session_id: SessionId) -> Result<(), SyncError> {
        let _region = self.locks.acquire(doc_id).await;

        let Some(now_empty) = self.rooms.leave(doc_id, session_id).await else {
            return Err(SyncError::NotJoined(doc_id.to_string()));
        };
        if let Err(err) = self.store.detach_session(doc_id, session_id).await {
            tracing::debug!("Detach of session {} from {}: {}", session_id, doc_id, err);
        }

        if now_empty {
            match self.checkpoint(doc_id).await {
                Ok(version) => {
                    self.store.evict(doc_id).await;
                    tracing::info!("Unloaded {} at v{}", doc_id, version);
                }
                Err(err) => {
                    tracing::warn!("Keeping {} loaded, checkpoint failed: {}", doc_id, err);
                }
            }
        }
        Ok(())
    }

    /// Resend the full state to a member (resync after a gap).
    ///
    /// Sent from inside the region so it cannot overtake a live broadcast.
    pub async fn resync(&self, doc_id: &str, session_id: SessionId) -> Result<u64, SyncError> {
        let _region = self.locks.acquire(doc_id).await;
        if !self.rooms.is_member(doc_id, session_id).await {
            return Err(SyncError::NotJoined(doc_id.to_string()));
        }

        let snapshot = self.store.snapshot(doc_id).await?;
        self.rooms
            .send_to(
                doc_id,
                session_id,
                ServerMessage::Snapshot {
                    doc_id: doc_id.to_string(),
                    content: snapshot.content,
                    version: snapshot.version,
                },
            )
            .await;
        Ok(snapshot.version)
    }

    /// Current content and version. A document nobody has open is recovered
    /// for the read only and not kept in the store.
    pub async fn snapshot(&self, doc_id: &str) -> Result<Snapshot, SyncError> {
        let _region = self.locks.acquire(doc_id).await;
        if self.store.contains(doc_id).await {
            return self.store.snapshot(doc_id).await;
        }
        Ok(self.recover(doc_id).await?.snapshot())
    }

    /// Who is editing a document, as seen by one of its members
    pub async fn collaborators(
        &self,
        doc_id: &str,
        session_id: SessionId,
    ) -> Result<Vec<Collaborator>, SyncError> {
        if !self.rooms.is_member(doc_id, session_id).await {
            return Err(SyncError::NotJoined(doc_id.to_string()));
        }
        Ok(self.rooms.members(doc_id).await)
    }

    /// Persist the current state if it moved since the last checkpoint, then
    /// compact the log through it when configured. Caller holds the region.
    async fn checkpoint(&self, doc_id: &str) -> Result<u64, SyncError> {
        let snapshot = self.store.snapshot(doc_id).await?;

        if snapshot.version > self.store.persisted_version(doc_id).await? {
            self.persistence
                .persist_snapshot(doc_id, &snapshot.content, snapshot.version)
                .await?;
            self.store.mark_persisted(doc_id, snapshot.version).await?;
            tracing::info!("Checkpointed {} at v{}", doc_id, snapshot.version);
        }

        if self.settings.compact_log {
            self.log.compact(doc_id, snapshot.version).await?;
        }
        Ok(snapshot.version)
    }

    /// Load a document into the store unless it is there already.
    /// Returns whether it had to be loaded. Caller holds the region.
    async fn ensure_loaded(&self, doc_id: &str) -> Result<bool, SyncError> {
        if self.store.contains(doc_id).await {
            return Ok(false);
        }
        let document = self.recover(doc_id).await?;
        self.store.insert(document).await;
        Ok(true)
    }

    /// Rebuild a document from its last checkpoint plus log replay
    async fn recover(&self, doc_id: &str) -> Result<Document, SyncError> {
        let (content, version) = self
            .persistence
            .load_document(doc_id)
            .await?
            .map(|checkpoint| (checkpoint.content, checkpoint.version))
            .unwrap_or_default();

        let floor = self.log.compacted_through(doc_id).await?;
        if floor > version {
            return Err(SyncError::persistence(anyhow::anyhow!(
                "log for {doc_id} is compacted through v{floor} but the checkpoint is at v{version}"
            )));
        }

        let mut document = Document::new(doc_id, content, version, self.settings.history_window);
        let mut replay = self.log.read_since(doc_id, version);
        let mut replayed = 0;
        while let Some(entry) = replay.try_next().await? {
            document.replay(entry)?;
            replayed += 1;
        }

        tracing::info!(
            "Recovered {} at v{} ({} replayed from v{})",
            doc_id,
            document.version(),
            replayed,
            version
        );
        Ok(document)
    }
}
