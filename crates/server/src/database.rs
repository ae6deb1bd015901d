// Database storage: operation log, login sessions, notes and who may edit them

use crate::auth::{Credentials, NoteAccess, Principal, SessionResolver};
use crate::error::SyncError;
use crate::oplog::{paged, OperationLog, OperationStream, PAGE_SIZE};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ot::{OpKind, Operation};
use protocol::AcceptedOperation;
use sha2::{Digest, Sha256};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

// Database manager shared by the log and the session resolver
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    // Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Database { pool };
        db.init().await?;

        Ok(db)
    }

    // Initialize database schema
    // Timestamps are RFC 3339 text so the same schema works on SQLite and MySQL
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                doc_id VARCHAR(255) NOT NULL,
                version BIGINT NOT NULL,
                op_kind VARCHAR(16) NOT NULL,
                op_position BIGINT NOT NULL,
                op_length BIGINT NOT NULL,
                op_text TEXT NOT NULL,
                author BIGINT NOT NULL,
                base_version BIGINT NOT NULL,
                user_id VARCHAR(255) NOT NULL,
                created_at VARCHAR(64) NOT NULL,
                PRIMARY KEY (doc_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create operations table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compactions (
                doc_id VARCHAR(255) PRIMARY KEY,
                through_version BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create compactions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token_hash CHAR(64) PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                expires_at VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                id VARCHAR(255) PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                content TEXT NOT NULL,
                updated_at VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create notes table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS note_collaborations (
                note_id VARCHAR(255) NOT NULL,
                collaborator_id VARCHAR(255) NOT NULL,
                created_at VARCHAR(64) NOT NULL,
                PRIMARY KEY (note_id, collaborator_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create note_collaborations table")?;

        tracing::info!("Database initialized successfully");
        Ok(())
    }

    // Issue a login session token for a user; only its digest is stored
    pub async fn create_session(&self, user_id: &str, ttl: chrono::Duration) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = (Utc::now() + ttl).to_rfc3339();

        sqlx::query("INSERT INTO sessions (token_hash, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(token_digest(&token))
            .bind(user_id)
            .bind(&expires_at)
            .execute(&self.pool)
            .await
            .context("Failed to create session")?;

        tracing::info!("Created session for user {}", user_id);
        Ok(token)
    }

    // Remove a login session
    pub async fn revoke_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_digest(token))
            .execute(&self.pool)
            .await
            .context("Failed to revoke session")?;

        Ok(())
    }

    // Stored content of a note, the version 0 base of its operation log
    pub async fn load_note_content(&self, note_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT content FROM notes WHERE id = ?")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load note")?;

        Ok(row.map(|(content,)| content))
    }

    // Create a note owned by `owner`
    pub async fn create_note(&self, note_id: &str, owner: &str, content: &str) -> Result<()> {
        sqlx::query("INSERT INTO notes (id, user_id, content, updated_at) VALUES (?, ?, ?, ?)")
            .bind(note_id)
            .bind(owner)
            .bind(content)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create note {note_id}"))?;

        tracing::info!("Created note {} for user {}", note_id, owner);
        Ok(())
    }

    // Let another user edit a note
    pub async fn share_note(&self, note_id: &str, collaborator_id: &str) -> Result<()> {
        if self.note_owner(note_id).await?.is_none() {
            bail!("Note {note_id} does not exist");
        }

        sqlx::query(
            "REPLACE INTO note_collaborations (note_id, collaborator_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(note_id)
        .bind(collaborator_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to share note")?;

        tracing::info!("Shared note {} with user {}", note_id, collaborator_id);
        Ok(())
    }

    async fn note_owner(&self, note_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT user_id FROM notes WHERE id = ?")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up note owner")?;

        Ok(row.map(|(owner,)| owner))
    }

    async fn fetch_page(&self, doc_id: &str, after: u64) -> Result<Vec<AcceptedOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT version, op_kind, op_position, op_length, op_text,
                   author, base_version, user_id, created_at
            FROM operations
            WHERE doc_id = ? AND version > ?
            ORDER BY version ASC
            LIMIT ?
            "#,
        )
        .bind(doc_id)
        .bind(after as i64)
        .bind(PAGE_SIZE as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read operations")?;

        rows.iter().map(decode_operation).collect()
    }

    async fn max_logged_version(&self, doc_id: &str) -> Result<u64> {
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM operations WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to read latest version")?;

        Ok(latest.unwrap_or(0) as u64)
    }

    async fn compaction_floor(&self, doc_id: &str) -> Result<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT through_version FROM compactions WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read compaction state")?;

        Ok(row.map(|(through,)| through as u64).unwrap_or(0))
    }
}

// Hex SHA-256 of a session token
fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn parse_kind(raw: &str) -> Result<OpKind> {
    Ok(match raw {
        "insert" => OpKind::Insert,
        "delete" => OpKind::Delete,
        "replace" => OpKind::Replace,
        other => bail!("Unknown operation kind {other:?}"),
    })
}

fn decode_operation(row: &AnyRow) -> Result<AcceptedOperation> {
    let created_at: String = row.try_get("created_at")?;
    let operation = Operation {
        kind: parse_kind(&row.try_get::<String, _>("op_kind")?)?,
        position: row.try_get::<i64, _>("op_position")? as usize,
        length: row.try_get::<i64, _>("op_length")? as usize,
        text: row.try_get("op_text")?,
        author: row.try_get::<i64, _>("author")? as u64,
        base_version: row.try_get::<i64, _>("base_version")? as u64,
    };

    Ok(AcceptedOperation {
        version: row.try_get::<i64, _>("version")? as u64,
        operation,
        user_id: row.try_get("user_id")?,
        timestamp: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse created_at")?,
    })
}

#[async_trait]
impl OperationLog for Database {
    async fn append(&self, doc_id: &str, entry: &AcceptedOperation) -> Result<(), SyncError> {
        let expected = self.latest_version(doc_id).await? + 1;
        if entry.version != expected {
            return Err(SyncError::persistence(anyhow::anyhow!(
                "cannot record version {} for {doc_id}, next is {expected}",
                entry.version
            )));
        }

        let op = &entry.operation;
        // The primary key rejects a second row with the same version
        sqlx::query(
            r#"
            INSERT INTO operations
                (doc_id, version, op_kind, op_position, op_length, op_text,
                 author, base_version, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc_id)
        .bind(entry.version as i64)
        .bind(op.kind.to_string())
        .bind(op.position as i64)
        .bind(op.length as i64)
        .bind(&op.text)
        .bind(op.author as i64)
        .bind(op.base_version as i64)
        .bind(&entry.user_id)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to append operation")
        .map_err(SyncError::persistence)?;

        tracing::debug!("Logged {} v{} for {}", op.kind, entry.version, doc_id);
        Ok(())
    }

    fn read_since(&self, doc_id: &str, from: u64) -> OperationStream {
        let db = self.clone();
        let doc_id = doc_id.to_string();

        paged(from, move |cursor| {
            let db = db.clone();
            let doc_id = doc_id.clone();
            async move {
                db.fetch_page(&doc_id, cursor)
                    .await
                    .map_err(SyncError::persistence)
            }
        })
    }

    async fn latest_version(&self, doc_id: &str) -> Result<u64, SyncError> {
        let logged = self
            .max_logged_version(doc_id)
            .await
            .map_err(SyncError::persistence)?;
        let floor = self
            .compaction_floor(doc_id)
            .await
            .map_err(SyncError::persistence)?;
        Ok(logged.max(floor))
    }

    async fn compact(&self, doc_id: &str, through: u64) -> Result<u64, SyncError> {
        let through = through.min(self.latest_version(doc_id).await?);
        if through <= self.compacted_through(doc_id).await? {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start compaction")
            .map_err(SyncError::persistence)?;

        sqlx::query("REPLACE INTO compactions (doc_id, through_version) VALUES (?, ?)")
            .bind(doc_id)
            .bind(through as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to record compaction")
            .map_err(SyncError::persistence)?;

        let removed = sqlx::query("DELETE FROM operations WHERE doc_id = ? AND version <= ?")
            .bind(doc_id)
            .bind(through as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to compact operations")
            .map_err(SyncError::persistence)?
            .rows_affected();

        tx.commit()
            .await
            .context("Failed to commit compaction")
            .map_err(SyncError::persistence)?;

        tracing::info!(
            "Compacted {} operations of {} through v{}",
            removed,
            doc_id,
            through
        );
        Ok(removed)
    }

    async fn compacted_through(&self, doc_id: &str) -> Result<u64, SyncError> {
        self.compaction_floor(doc_id)
            .await
            .map_err(SyncError::persistence)
    }
}

#[async_trait]
impl SessionResolver for Database {
    async fn resolve(&self, credentials: &Credentials) -> Result<Principal, SyncError> {
        let token = credentials.token().ok_or(SyncError::Unauthenticated)?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, expires_at FROM sessions WHERE token_hash = ?")
                .bind(token_digest(token))
                .fetch_optional(&self.pool)
                .await
                .context("Failed to look up session")
                .map_err(SyncError::persistence)?;

        let (user_id, expires_at) = row.ok_or(SyncError::Unauthenticated)?;
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .context("Failed to parse session expiry")
            .map_err(SyncError::persistence)?;

        if expires_at <= Utc::now() {
            tracing::debug!("Expired session for user {}", user_id);
            return Err(SyncError::Unauthenticated);
        }

        Ok(Principal { user_id })
    }
}

#[async_trait]
impl NoteAccess for Database {
    // The owner and every collaborator the note was shared with may edit it
    async fn authorize(&self, user_id: &str, doc_id: &str) -> Result<(), SyncError> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT n.user_id, nc.collaborator_id
            FROM notes n
            LEFT JOIN note_collaborations nc
                ON nc.note_id = n.id AND nc.collaborator_id = ?
            WHERE n.id = ?
            "#,
        )
        .bind(user_id)
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check note access")
        .map_err(SyncError::persistence)?;

        match row {
            None => Err(SyncError::NoteNotFound(doc_id.to_string())),
            Some((owner, shared)) if owner == user_id || shared.is_some() => Ok(()),
            Some(_) => {
                tracing::debug!("Denied {} on note {}", user_id, doc_id);
                Err(SyncError::Forbidden {
                    user_id: user_id.to_string(),
                    doc_id: doc_id.to_string(),
                })
            }
        }
    }
}
