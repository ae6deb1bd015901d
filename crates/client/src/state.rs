// Local view of a joined note, kept in step with the server's version order

use anyhow::{bail, Context, Result};
use ot::{OpKind, Operation, SessionId};
use protocol::{AcceptedOperation, Collaborator, OperationRequest};

/// What the caller should do after feeding in a server event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sync {
    /// Applied in order
    Applied,
    /// Already seen or not for us
    Ignored,
    /// Out of order or unusable; ask for a snapshot
    Resync,
}

/// Our own edit, sent but not yet acknowledged
#[derive(Debug, Clone)]
struct Pending {
    client_seq: u64,
    /// Rebased over every remote operation that arrived since sending
    operation: Operation,
}

#[derive(Debug, Clone, Default)]
pub struct ClientState {
    /// Note we are editing
    pub doc_id: Option<String>,
    /// Our session ID (assigned by server)
    pub session_id: Option<SessionId>,
    /// Document content, including our pending edit
    pub content: String,
    /// Last server version included in `content`
    pub version: u64,
    /// Catch-up finished
    pub live: bool,
    pub collaborators: Vec<Collaborator>,
    pending: Option<Pending>,
    next_seq: u64,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joined(&mut self, doc_id: String, session_id: SessionId, others: Vec<Collaborator>) {
        *self = ClientState {
            doc_id: Some(doc_id),
            session_id: Some(session_id),
            collaborators: others,
            next_seq: self.next_seq,
            ..ClientState::default()
        };
    }

    pub fn left(&mut self) {
        *self = ClientState {
            next_seq: self.next_seq,
            ..ClientState::default()
        };
    }

    /// Whether a message about `doc_id` concerns the note being edited
    pub fn is_current(&self, doc_id: &str) -> bool {
        self.doc_id.as_deref() == Some(doc_id)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Replace everything with the server's state. A pending edit is dropped;
    /// if the server still accepts it, the acknowledgement is older than the snapshot.
    pub fn load_snapshot(&mut self, content: String, version: u64) {
        self.content = content;
        self.version = version;
        self.pending = None;
    }

    /// Apply an edit locally and build the request that sends it.
    pub fn local_edit(&mut self, position: i64, length: i64, text: &str) -> Result<OperationRequest> {
        let session_id = self.session_id.context("Not in a note. Use 'join' first.")?;
        if self.pending.is_some() {
            bail!("Previous edit not acknowledged yet");
        }

        let kind = match (length, text.is_empty()) {
            (0, _) => OpKind::Insert,
            (_, true) => OpKind::Delete,
            _ => OpKind::Replace,
        };
        let operation =
            Operation::from_parts(kind, position, length, text.to_string(), session_id, self.version)?;
        ot::apply(&mut self.content, &operation)?;

        self.next_seq += 1;
        self.pending = Some(Pending {
            client_seq: self.next_seq,
            operation,
        });

        Ok(OperationRequest {
            kind,
            position,
            length,
            text: text.to_string(),
            base_version: self.version,
            client_seq: self.next_seq,
        })
    }

    /// Someone else's accepted operation
    pub fn on_remote(&mut self, accepted: &AcceptedOperation) -> Sync {
        if accepted.version <= self.version {
            return Sync::Ignored;
        }
        if accepted.version != self.version + 1 {
            return Sync::Resync;
        }

        let remote = &accepted.operation;
        let result = match self.pending.as_mut() {
            None => ot::apply(&mut self.content, remote),
            Some(pending) => {
                // Our edit is already in `content`; move the remote one past it
                // and our edit over the remote one, as the server will.
                let rebased = ot::transform(remote, &pending.operation);
                pending.operation = ot::transform(&pending.operation, remote);
                ot::apply(&mut self.content, &rebased)
            }
        };

        match result {
            Ok(_) => {
                self.version = accepted.version;
                Sync::Applied
            }
            Err(_) => Sync::Resync,
        }
    }

    /// Acknowledgement of our own edit
    pub fn on_accepted(&mut self, client_seq: u64, accepted: &AcceptedOperation) -> Sync {
        match &self.pending {
            Some(pending) if pending.client_seq == client_seq => {}
            _ => return Sync::Ignored,
        }
        if accepted.version != self.version + 1 {
            return Sync::Resync;
        }

        self.pending = None;
        self.version = accepted.version;
        Sync::Applied
    }

    /// Our edit was refused; our content no longer matches any server version
    pub fn on_rejected(&mut self, client_seq: u64) -> Sync {
        match &self.pending {
            Some(pending) if pending.client_seq == client_seq => {
                self.pending = None;
                Sync::Resync
            }
            _ => Sync::Ignored,
        }
    }

    pub fn user_joined(&mut self, collaborator: Collaborator) {
        if !self.collaborators.contains(&collaborator) {
            self.collaborators.push(collaborator);
        }
    }

    pub fn user_left(&mut self, collaborator: &Collaborator) {
        self.collaborators.retain(|c| c.session_id != collaborator.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(version: u64, operation: Operation) -> AcceptedOperation {
        AcceptedOperation {
            version,
            operation,
            user_id: "someone".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn joined(session_id: SessionId, content: &str) -> ClientState {
        let mut state = ClientState::new();
        state.joined("n1".to_string(), session_id, vec![]);
        state.load_snapshot(content.to_string(), 0);
        state
    }

    #[test]
    fn test_edit_requires_join() {
        let mut state = ClientState::new();
        assert!(state.local_edit(0, 0, "x").is_err());
    }

    #[test]
    fn test_local_edit_builds_request() {
        let mut state = joined(1, "HELLO");

        let request = state.local_edit(1, 3, "ipp").unwrap();
        assert_eq!(request.kind, OpKind::Replace);
        assert_eq!(request.base_version, 0);
        assert_eq!(request.client_seq, 1);
        assert_eq!(state.content, "HippO");

        // One edit in flight at a time
        assert!(state.local_edit(0, 0, "x").is_err());
        assert!(state.has_pending());
    }

    #[test]
    fn test_out_of_range_edit_leaves_content() {
        let mut state = joined(1, "abc");
        assert!(state.local_edit(2, 5, "").is_err());
        assert!(state.local_edit(-1, 0, "x").is_err());
        assert_eq!(state.content, "abc");
        assert!(!state.has_pending());
    }

    #[test]
    fn test_remote_ops_apply_in_order() {
        let mut state = joined(1, "AC");

        assert_eq!(
            state.on_remote(&accepted(1, Operation::insert(1, "B", 2, 0))),
            Sync::Applied
        );
        assert_eq!(
            state.on_remote(&accepted(1, Operation::insert(1, "B", 2, 0))),
            Sync::Ignored
        );
        assert_eq!(
            state.on_remote(&accepted(3, Operation::insert(0, "z", 2, 2))),
            Sync::Resync
        );
        assert_eq!(state.content, "ABC");
        assert_eq!(state.version, 1);
    }

    #[test]
    fn test_pending_edit_converges_with_server() {
        // Server order: session 2's delete (v1), then our rebased insert (v2)
        let mut state = joined(1, "HELLO");
        let request = state.local_edit(5, 0, "!").unwrap();
        assert_eq!(state.content, "HELLO!");

        let remote = Operation::delete(0, 2, 2, 0);
        assert_eq!(state.on_remote(&accepted(1, remote.clone())), Sync::Applied);
        assert_eq!(state.content, "LLO!");

        let ours = request.to_operation(1).unwrap();
        let server_rebased = ot::transform(&ours, &remote);
        assert_eq!(
            state.on_accepted(request.client_seq, &accepted(2, server_rebased)),
            Sync::Applied
        );
        assert_eq!(state.version, 2);
        assert!(!state.has_pending());

        let mut server = "HELLO".to_string();
        ot::apply(&mut server, &remote).unwrap();
        ot::apply(&mut server, &ot::transform(&ours, &remote)).unwrap();
        assert_eq!(state.content, server);
    }

    #[test]
    fn test_rejection_asks_for_snapshot() {
        let mut state = joined(1, "abc");
        let request = state.local_edit(0, 0, "x").unwrap();

        assert_eq!(state.on_rejected(request.client_seq + 1), Sync::Ignored);
        assert_eq!(state.on_rejected(request.client_seq), Sync::Resync);
        assert!(!state.has_pending());

        state.load_snapshot("abc".to_string(), 0);
        assert_eq!(state.content, "abc");
    }

    #[test]
    fn test_presence_tracking() {
        let mut state = joined(1, "");
        let bob = Collaborator {
            session_id: 2,
            user_id: "bob".to_string(),
            joined_at: chrono::Utc::now(),
        };
        state.user_joined(bob.clone());
        state.user_joined(bob.clone());
        assert_eq!(state.collaborators.len(), 1);
        state.user_left(&bob);
        assert!(state.collaborators.is_empty());
    }

    #[test]
    fn test_only_current_note_is_current() {
        let mut state = ClientState::new();
        assert!(!state.is_current("n1"));
        state.joined("n1".to_string(), 1, vec![]);
        assert!(state.is_current("n1"));
        assert!(!state.is_current("n2"));
        state.left();
        assert!(!state.is_current("n1"));
    }
}
