// Error taxonomy for the synchronization core

use ot::OperationError;
use protocol::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no valid session")]
    Unauthenticated,

    #[error("invalid operation: {0}")]
    Validation(#[from] OperationError),

    #[error("base version {base} is ahead of document version {current}")]
    FutureVersion { base: u64, current: u64 },

    /// The store moved on between snapshot and apply. Always retried.
    #[error("operation based on version {base}, document is at {current}")]
    StaleOperation { base: u64, current: u64 },

    #[error("gave up after {attempts} attempts against a moving document")]
    Conflict { attempts: usize },

    #[error("history before version {floor} has been compacted (base {base})")]
    HistoryUnavailable { base: u64, floor: u64 },

    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("document {0} is not loaded")]
    NotLoaded(String),

    #[error("not joined to document {0}")]
    NotJoined(String),

    #[error("note {0} does not exist")]
    NoteNotFound(String),

    #[error("{user_id} may not edit note {doc_id}")]
    Forbidden { user_id: String, doc_id: String },
}

impl SyncError {
    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        SyncError::Persistence(err.into())
    }

    /// Category reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Unauthenticated => ErrorKind::Unauthenticated,
            SyncError::Validation(_) | SyncError::FutureVersion { .. } => ErrorKind::Validation,
            SyncError::StaleOperation { .. }
            | SyncError::Conflict { .. }
            | SyncError::HistoryUnavailable { .. } => ErrorKind::Conflict,
            SyncError::Persistence(_) => ErrorKind::Persistence,
            SyncError::NotJoined(_) => ErrorKind::NotJoined,
            SyncError::NoteNotFound(_) => ErrorKind::NotFound,
            SyncError::Forbidden { .. } => ErrorKind::Forbidden,
            SyncError::NotLoaded(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            SyncError::from(OperationError::NegativePosition(-1)).kind(),
            ErrorKind::Validation
        );
        assert_eq!(SyncError::Conflict { attempts: 3 }.kind(), ErrorKind::Conflict);
        assert_eq!(
            SyncError::HistoryUnavailable { base: 1, floor: 10 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SyncError::persistence(anyhow::anyhow!("disk full")).kind(),
            ErrorKind::Persistence
        );
        assert_eq!(
            SyncError::Forbidden {
                user_id: "mallory".to_string(),
                doc_id: "n1".to_string(),
            }
            .kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn test_persistence_message_keeps_context() {
        let err = SyncError::persistence(
            anyhow::anyhow!("disk full").context("Failed to append operation"),
        );
        assert_eq!(
            err.to_string(),
            "persistence failure: Failed to append operation: disk full"
        );
    }
}
