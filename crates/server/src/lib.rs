// Real-time collaborative note synchronization server
//
// Clients connect over WebSocket, join notes and submit positional edits.
// The gateway rebases each edit onto the current version, applies it to the
// in-memory document, records it in the operation log and fans it out to
// everyone else editing the note.

pub mod auth;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod file_store;
pub mod gateway;
pub mod oplog;
pub mod persistence;
pub mod room;
pub mod server;

pub use error::SyncError;
pub use gateway::{GatewaySettings, SharedGateway, SyncGateway};
