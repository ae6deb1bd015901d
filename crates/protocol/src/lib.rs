// Wire protocol shared by the sync server and its clients

pub mod messages;

pub use messages::{
    AcceptedOperation, ClientMessage, Collaborator, ErrorKind, OperationRequest, ServerMessage,
};
