// Main entry point for the note synchronization server

use anyhow::{bail, Context, Result};
use server::auth::{NoteAccess, OpenAccess, SessionResolver, StaticTokens};
use server::config::ServerConfig;
use server::database::Database;
use server::document::DocumentStore;
use server::file_store::FileStore;
use server::persistence::Storage;
use server::{server as ws, SyncGateway};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Initialize database
    tracing::info!("Connecting to database: {}", config.database_url);
    let db = Database::new(&config.database_url, config.database_max_connections).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return admin(&db, &args).await;
    }

    tracing::info!("Starting note sync server...");

    // Initialize file store
    tracing::info!("Initializing file store: {}", config.file_store_path.display());
    let file_store = FileStore::new(&config.file_store_path).await?;

    let sessions: Arc<dyn SessionResolver> = if config.dev_tokens.is_empty() {
        Arc::new(db.clone())
    } else {
        tracing::warn!(
            "Using {} static development tokens instead of database sessions",
            config.dev_tokens.len()
        );
        Arc::new(StaticTokens::new(config.dev_tokens.clone()))
    };

    let access: Arc<dyn NoteAccess> = if config.open_notes {
        tracing::warn!("OPEN_NOTES is set, every user may join every note");
        Arc::new(OpenAccess)
    } else {
        Arc::new(db.clone())
    };

    let gateway = SyncGateway::new(
        Arc::new(DocumentStore::new()),
        Arc::new(db.clone()),
        Arc::new(Storage::new(file_store, Some(db))),
        config.gateway.clone(),
    )
    .with_access(access);
    tracing::info!("Gateway settings: {:?}", config.gateway);

    // Create server state
    let state = ws::ServerState::new(Arc::new(gateway), sessions);

    // Start server
    ws::create_server(state, config.bind_addr).await?;

    Ok(())
}

// One-shot maintenance commands against the configured database
async fn admin(db: &Database, args: &[String]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["create-note", note_id, owner, content @ ..] => {
            db.create_note(note_id, owner, &content.join(" ")).await?;
            println!("Created note {note_id} for {owner}");
        }
        ["share-note", note_id, user_id] => {
            db.share_note(note_id, user_id).await?;
            println!("Shared note {note_id} with {user_id}");
        }
        ["issue-token", user_id, rest @ ..] => {
            let hours: i64 = match rest {
                [] => 24,
                [hours] => hours
                    .parse()
                    .with_context(|| format!("Invalid hours: {hours:?}"))?,
                _ => bail!("usage: issue-token <user> [hours]"),
            };
            let token = db
                .create_session(user_id, chrono::Duration::hours(hours))
                .await?;
            println!("{token}");
        }
        ["revoke-token", token] => {
            db.revoke_session(token).await?;
            println!("Revoked");
        }
        _ => bail!(
            "usage: server [create-note <id> <owner> [content..] | share-note <id> <user> | issue-token <user> [hours] | revoke-token <token>]"
        ),
    }
    Ok(())
}
