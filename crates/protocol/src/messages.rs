// WebSocket message types for client-server communication

use chrono::{DateTime, Utc};
use ot::{OpKind, Operation, OperationError, SessionId};
use serde::{Deserialize, Serialize};

// An operation once the server has accepted it: rebased, versioned and stamped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedOperation {
    // Document version this operation produced
    pub version: u64,
    pub operation: Operation,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

// A session currently editing a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collaborator {
    pub session_id: SessionId,
    pub user_id: String,
    // When the session joined the document
    pub joined_at: DateTime<Utc>,
}

// An operation as a client submits it, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OpKind,
    pub position: i64,
    #[serde(default)]
    pub length: i64,
    #[serde(default)]
    pub text: String,
    // Document version the client edited
    pub base_version: u64,
    // Echoed back in the acknowledgement or rejection
    #[serde(default)]
    pub client_seq: u64,
}

impl OperationRequest {
    // Check the shape and stamp the author
    pub fn to_operation(&self, author: SessionId) -> Result<Operation, OperationError> {
        Operation::from_parts(
            self.kind,
            self.position,
            self.length,
            self.text.clone(),
            author,
            self.base_version,
        )
    }
}

// Error categories surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Validation,
    Conflict,
    Persistence,
    NotJoined,
    NotFound,
    Forbidden,
    Internal,
}

// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    // Start editing a document; without a since version the server sends a full snapshot
    JoinDocument {
        doc_id: String,
        #[serde(default)]
        since_version: Option<u64>,
    },

    // Stop editing a document
    LeaveDocument { doc_id: String },

    // Submit an edit
    SubmitOperation {
        doc_id: String,
        operation: OperationRequest,
    },

    // Ask for the current content and version (resync)
    RequestSnapshot { doc_id: String },

    // Ask who else is editing
    ListCollaborators { doc_id: String },

    // Heartbeat/ping
    Ping,
}

// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    // Joined a document; catch-up follows
    Joined {
        doc_id: String,
        session_id: SessionId,
        collaborators: Vec<Collaborator>,
    },

    // Full document state
    Snapshot {
        doc_id: String,
        content: String,
        version: u64,
    },

    // An accepted operation, from catch-up or live
    OperationApplied {
        doc_id: String,
        operation: AcceptedOperation,
    },

    // Catch-up finished; live operations follow
    CaughtUp { doc_id: String, version: u64 },

    // Our own operation was accepted, possibly rebased
    Accepted {
        doc_id: String,
        client_seq: u64,
        operation: AcceptedOperation,
    },

    // Our own operation was refused
    Rejected {
        doc_id: String,
        client_seq: u64,
        kind: ErrorKind,
        message: String,
    },

    // Another session joined
    UserJoined {
        doc_id: String,
        collaborator: Collaborator,
    },

    // Another session left
    UserLeft {
        doc_id: String,
        collaborator: Collaborator,
    },

    // Sessions currently editing
    Collaborators {
        doc_id: String,
        collaborators: Vec<Collaborator>,
    },

    // Error not tied to a submission
    Error { kind: ErrorKind, message: String },

    // Pong response to ping
    Pong,
}

impl ServerMessage {
    pub fn operation_applied(doc_id: &str, operation: &AcceptedOperation) -> Self {
        ServerMessage::OperationApplied {
            doc_id: doc_id.to_string(),
            operation: operation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::SubmitOperation {
            doc_id: "42".to_string(),
            operation: OperationRequest {
                kind: OpKind::Insert,
                position: 3,
                length: 0,
                text: "hi".to_string(),
                base_version: 7,
                client_seq: 1,
            },
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "submit-operation");
        assert_eq!(json["operation"]["kind"], "insert");

        let parsed: ClientMessage = serde_json::from_value(json).unwrap();
        match parsed {
            ClientMessage::SubmitOperation { doc_id, operation } => {
                assert_eq!(doc_id, "42");
                assert_eq!(operation.base_version, 7);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_join_defaults_to_snapshot() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"join-document","doc_id":"n1"}"#).unwrap();
        match parsed {
            ClientMessage::JoinDocument { since_version, .. } => assert_eq!(since_version, None),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_negative_position_survives_parsing() {
        // Validation is the gateway's job, so the wire type must carry it through.
        let request: OperationRequest = serde_json::from_str(
            r#"{"kind":"delete","position":-2,"length":1,"base_version":0}"#,
        )
        .unwrap();
        assert_eq!(request.position, -2);
        assert_eq!(
            request.to_operation(1),
            Err(OperationError::NegativePosition(-2))
        );
    }

    #[test]
    fn test_operation_applied_event_name() {
        let accepted = AcceptedOperation {
            version: 3,
            operation: Operation::insert(0, "a", 1, 2),
            user_id: "user_1".to_string(),
            timestamp: Utc::now(),
        };

        let msg = ServerMessage::operation_applied("n1", &accepted);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"operation-applied""#));

        let deserialized: ServerMessage = serde_json::from_str(&json).unwrap();
        match deserialized {
            ServerMessage::OperationApplied { operation, .. } => {
                assert_eq!(operation, accepted);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_rejection_kind_wire_name() {
        let msg = ServerMessage::Rejected {
            doc_id: "n1".to_string(),
            client_seq: 4,
            kind: ErrorKind::Conflict,
            message: "retry".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "rejected");
        assert_eq!(json["kind"], "conflict");
    }
}
