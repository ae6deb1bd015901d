// Session authentication and note access for WebSocket connections

use crate::error::SyncError;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::Deserialize;
use std::collections::HashMap;

/// Query string of the upgrade request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Credentials presented by a connecting client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials {
            token: Some(token.into()),
        }
    }

    /// Read the token from `Authorization: Bearer ...`, falling back to a
    /// `token` query parameter for browsers that cannot set headers on
    /// WebSocket requests.
    pub fn from_request(headers: &HeaderMap, query: &TokenQuery) -> Self {
        let from_header = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);

        Credentials {
            token: from_header
                .or(query.token.as_deref())
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Map credentials to a user, or `SyncError::Unauthenticated`
    async fn resolve(&self, credentials: &Credentials) -> Result<Principal, SyncError>;
}

/// Fixed token table for development
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        StaticTokens { tokens }
    }

    pub fn with(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(token.to_string(), user_id.to_string());
        self
    }
}

#[async_trait]
impl SessionResolver for StaticTokens {
    async fn resolve(&self, credentials: &Credentials) -> Result<Principal, SyncError> {
        credentials
            .token()
            .and_then(|token| self.tokens.get(token))
            .map(|user_id| Principal {
                user_id: user_id.clone(),
            })
            .ok_or(SyncError::Unauthenticated)
    }
}

/// Who may open which note
#[async_trait]
pub trait NoteAccess: Send + Sync {
    /// `NoteNotFound` for an unknown note, `Forbidden` if `user_id` is
    /// neither its owner nor a collaborator
    async fn authorize(&self, user_id: &str, doc_id: &str) -> Result<(), SyncError>;
}

/// Every authenticated user may edit every note, and joining an unknown id
/// starts an empty one
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

#[async_trait]
impl NoteAccess for OpenAccess {
    async fn authorize(&self, _user_id: &str, _doc_id: &str) -> Result<(), SyncError> {
        Ok(())
    }
}
