// Note sync terminal client
// Connects to the server via WebSocket and edits a shared note in real time

mod state;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use protocol::{AcceptedOperation, ClientMessage, ServerMessage};
use state::{ClientState, Sync};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// Entry point
#[tokio::main]
async fn main() -> Result<()> {
    // Get server URL and session token from env
    let server_url =
        std::env::var("SERVER_URL").unwrap_or_else(|_| "ws://127.0.0.1:9001/ws".to_string());
    let token = std::env::var("NOTESYNC_TOKEN").context("NOTESYNC_TOKEN is not set")?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Note Sync - Collaborative Notes Client          ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Connecting to server at {}...", server_url);

    let mut request = server_url
        .as_str()
        .into_client_request()
        .context("Invalid SERVER_URL")?;
    request.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).context("Invalid NOTESYNC_TOKEN")?,
    );

    // Open the socket with the session token attached
    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to server")?;

    println!("✓ Connected to server!");
    println!();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Note state shared with the receive task
    let state = Arc::new(Mutex::new(ClientState::new()));

    // Outgoing messages funnel through one writer
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ClientMessage>();

    // Spawn task to send messages to server
    let send_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    eprintln!("[error] Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    // Spawn task to receive messages from server
    let state_for_recv = state.clone();
    let tx_for_recv = msg_tx.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(server_msg) => {
                        handle_server_message(&state_for_recv, &tx_for_recv, server_msg).await;
                    }
                    Err(e) => {
                        println!("[error] Failed to parse server message: {}", e);
                    }
                }
            }
        }
        println!("\n[info] Disconnected from server");
    });

    print_help();

    // Read commands until quit or EOF
    let stdin = io::stdin();
    let mut input = String::new();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        input.clear();
        match stdin.read_line(&mut input) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
        let cmd = parts[0].to_lowercase();
        let args = parts.get(1).copied().unwrap_or("");

        match cmd.as_str() {
            "help" | "h" | "?" => {
                print_help();
            }

            "join" | "j" => {
                if let Err(e) = handle_join_command(args, &state, &msg_tx).await {
                    println!("[error] {}", e);
                }
            }

            "leave" | "l" => {
                let mut state_guard = state.lock().await;
                if let Some(doc_id) = state_guard.doc_id.clone() {
                    msg_tx.send(ClientMessage::LeaveDocument { doc_id }).ok();
                    state_guard.left();
                    println!("[info] Left the note");
                } else {
                    println!("[info] Not in a note.");
                }
            }

            "insert" | "i" => {
                if let Err(e) = handle_insert_command(args, &state, &msg_tx).await {
                    println!("[error] {}", e);
                }
            }

            "delete" | "d" => {
                if let Err(e) = handle_delete_command(args, &state, &msg_tx).await {
                    println!("[error] {}", e);
                }
            }

            "replace" | "r" => {
                if let Err(e) = handle_replace_command(args, &state, &msg_tx).await {
                    println!("[error] {}", e);
                }
            }

            "show" | "s" => {
                let state_guard = state.lock().await;
                if state_guard.doc_id.is_some() {
                    println!("─────────────────────────────────────────");
                    if state_guard.content.is_empty() {
                        println!("(empty note)");
                    } else {
                        println!("{}", state_guard.content);
                    }
                    println!("─────────────────────────────────────────");
                } else {
                    println!("[info] Not in a note. Use 'join' first.");
                }
            }

            "sync" => {
                let state_guard = state.lock().await;
                if let Some(doc_id) = state_guard.doc_id.clone() {
                    msg_tx.send(ClientMessage::RequestSnapshot { doc_id }).ok();
                    println!("[info] Sync requested");
                } else {
                    println!("[info] Not in a note. Use 'join' first.");
                }
            }

            "who" | "w" => {
                let state_guard = state.lock().await;
                if let Some(doc_id) = state_guard.doc_id.clone() {
                    msg_tx.send(ClientMessage::ListCollaborators { doc_id }).ok();
                } else {
                    println!("[info] Not in a note. Use 'join' first.");
                }
            }

            "ping" => {
                msg_tx.send(ClientMessage::Ping).ok();
                println!("[info] Ping sent");
            }

            "status" => {
                let state_guard = state.lock().await;
                println!("─────────────────────────────────────────");
                println!("Note:       {:?}", state_guard.doc_id);
                println!("Session ID: {:?}", state_guard.session_id);
                println!("Version:    {}", state_guard.version);
                println!("Live:       {}", state_guard.live);
                println!("Pending:    {}", state_guard.has_pending());
                println!("Content length: {} chars", ot::char_len(&state_guard.content));
                println!("─────────────────────────────────────────");
            }

            "quit" | "exit" | "q" => {
                println!("[info] Goodbye!");
                break;
            }

            _ => {
                println!(
                    "[error] Unknown command '{}'. Type 'help' for available commands.",
                    cmd
                );
            }
        }
    }

    // Stop both socket tasks
    send_task.abort();
    recv_task.abort();

    Ok(())
}

// REPL commands

fn print_help() {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│                      Available Commands                     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  join <note_id> [since]              - Start editing a note │");
    println!("│  leave                               - Stop editing         │");
    println!("│  insert <pos> <text>                 - Insert text at pos   │");
    println!("│  delete <pos> <len>                  - Delete len chars     │");
    println!("│  replace <pos> <len> <text>          - Replace len chars    │");
    println!("│  show                                - Show note            │");
    println!("│  sync                                - Request full sync    │");
    println!("│  who                                 - List collaborators   │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│  status                              - Show connection info │");
    println!("│  ping                                - Ping server          │");
    println!("│  help                                - Show this help       │");
    println!("│  quit                                - Exit client          │");
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
    println!("Shortcuts: j=join, l=leave, i=insert, d=delete, r=replace, s=show, w=who, q=quit");
    println!();
}

async fn handle_join_command(
    args: &str,
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
) -> Result<()> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.is_empty() {
        anyhow::bail!("Usage: join <note_id> [since_version]");
    }

    let doc_id = parts[0].to_string();
    let since_version = parts
        .get(1)
        .map(|v| v.parse::<u64>())
        .transpose()
        .context("Version must be a number")?;

    let mut state_guard = state.lock().await;
    if let Some(current) = state_guard.doc_id.clone() {
        msg_tx.send(ClientMessage::LeaveDocument { doc_id: current })?;
        state_guard.left();
    }

    msg_tx.send(ClientMessage::JoinDocument {
        doc_id: doc_id.clone(),
        since_version,
    })?;

    println!("[info] Joining note {}...", doc_id);
    Ok(())
}

async fn submit_edit(
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
    position: i64,
    length: i64,
    text: &str,
) -> Result<()> {
    let mut state_guard = state.lock().await;
    let doc_id = state_guard
        .doc_id
        .clone()
        .context("Not in a note. Use 'join' first.")?;

    // Shows up locally before the server acknowledges it
    let operation = state_guard.local_edit(position, length, text)?;
    msg_tx.send(ClientMessage::SubmitOperation { doc_id, operation })?;
    Ok(())
}

async fn handle_insert_command(
    args: &str,
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
) -> Result<()> {
    let parts: Vec<&str> = args.splitn(2, ' ').collect();
    if parts.len() < 2 {
        anyhow::bail!("Usage: insert <position> <text>");
    }

    let pos: i64 = parts[0].parse().context("Position must be a number")?;
    submit_edit(state, msg_tx, pos, 0, parts[1]).await?;

    println!("[local] Inserted '{}' at position {}", parts[1], pos);
    Ok(())
}

async fn handle_delete_command(
    args: &str,
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
) -> Result<()> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() < 2 {
        anyhow::bail!("Usage: delete <position> <length>");
    }

    let pos: i64 = parts[0].parse().context("Position must be a number")?;
    let len: i64 = parts[1].parse().context("Length must be a number")?;
    if len == 0 {
        anyhow::bail!("Length must be positive");
    }
    submit_edit(state, msg_tx, pos, len, "").await?;

    println!("[local] Deleted {} chars at position {}", len, pos);
    Ok(())
}

async fn handle_replace_command(
    args: &str,
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
) -> Result<()> {
    let parts: Vec<&str> = args.splitn(3, ' ').collect();
    if parts.len() < 3 {
        anyhow::bail!("Usage: replace <position> <length> <text>");
    }

    let pos: i64 = parts[0].parse().context("Position must be a number")?;
    let len: i64 = parts[1].parse().context("Length must be a number")?;
    submit_edit(state, msg_tx, pos, len, parts[2]).await?;

    println!("[local] Replaced {} chars at position {} with '{}'", len, pos, parts[2]);
    Ok(())
}

// Incoming events

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

fn describe(accepted: &AcceptedOperation) -> String {
    let op = &accepted.operation;
    format!(
        "v{} {} {} @{} len {} {:?} ({})",
        accepted.version,
        accepted.timestamp.format("%H:%M:%S"),
        op.kind,
        op.position,
        op.length,
        op.text,
        accepted.user_id
    )
}

async fn handle_server_message(
    state: &Arc<Mutex<ClientState>>,
    msg_tx: &mpsc::UnboundedSender<ClientMessage>,
    msg: ServerMessage,
) {
    let mut state_guard = state.lock().await;

    let outcome = match msg {
        ServerMessage::Joined {
            doc_id,
            session_id,
            collaborators,
        } => {
            println!();
            println!("╔══════════════════════════════════════════════════════════════╗");
            println!("║                      Joined Note Successfully                ║");
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║  Note:       {:<47} ║", doc_id);
            println!("║  Session ID: {:<47} ║", session_id);
            println!("║  Editing:    {:<47} ║", collaborators.len() + 1);
            println!("╚══════════════════════════════════════════════════════════════╝");
            state_guard.joined(doc_id, session_id, collaborators);
            Sync::Applied
        }

        ServerMessage::Snapshot {
            doc_id,
            content,
            version,
        } => {
            if !state_guard.is_current(&doc_id) {
                Sync::Ignored
            } else {
                println!();
                println!("[sync] {} at version {} ({} chars)", doc_id, version, ot::char_len(&content));
                state_guard.load_snapshot(content, version);
                Sync::Applied
            }
        }

        ServerMessage::OperationApplied { doc_id, .. } if !state_guard.is_current(&doc_id) => {
            Sync::Ignored
        }

        ServerMessage::OperationApplied { operation, .. } => {
            let outcome = state_guard.on_remote(&operation);
            if outcome == Sync::Applied && state_guard.live {
                println!();
                println!("[remote] {}", describe(&operation));
            }
            outcome
        }

        ServerMessage::CaughtUp { doc_id, version } => {
            state_guard.live = true;
            println!();
            println!("[info] Up to date with {} at version {}", doc_id, version);
            if state_guard.version != version {
                Sync::Resync
            } else {
                Sync::Applied
            }
        }

        // Late acknowledgements for a note we already left
        ServerMessage::Accepted { doc_id, .. } if !state_guard.is_current(&doc_id) => Sync::Ignored,

        ServerMessage::Accepted {
            client_seq,
            operation,
            ..
        } => {
            let outcome = state_guard.on_accepted(client_seq, &operation);
            if outcome == Sync::Applied {
                println!();
                println!("[ack] {}", describe(&operation));
            }
            outcome
        }

        ServerMessage::Rejected {
            client_seq,
            kind,
            message,
            ..
        } => {
            println!();
            println!("[error] Edit {} rejected ({:?}): {}", client_seq, kind, message);
            state_guard.on_rejected(client_seq)
        }

        ServerMessage::UserJoined { collaborator, .. } => {
            println!();
            println!(
                "[info] {} joined (session {}) at {}",
                collaborator.user_id,
                collaborator.session_id,
                collaborator.joined_at.format("%H:%M:%S")
            );
            state_guard.user_joined(collaborator);
            Sync::Applied
        }

        ServerMessage::UserLeft { collaborator, .. } => {
            println!();
            println!(
                "[info] {} left (session {})",
                collaborator.user_id, collaborator.session_id
            );
            state_guard.user_left(&collaborator);
            Sync::Applied
        }

        ServerMessage::Collaborators { collaborators, .. } => {
            println!();
            println!("─────────────────────────────────────────");
            for c in &collaborators {
                let marker = if Some(c.session_id) == state_guard.session_id {
                    " (you)"
                } else {
                    ""
                };
                println!(
                    "  {} [session {}] since {}{}",
                    c.user_id,
                    c.session_id,
                    c.joined_at.format("%H:%M:%S"),
                    marker
                );
            }
            println!("─────────────────────────────────────────");
            state_guard.collaborators = collaborators;
            Sync::Applied
        }

        ServerMessage::Error { kind, message } => {
            println!();
            println!("[error] {:?}: {}", kind, message);
            Sync::Ignored
        }

        ServerMessage::Pong => {
            println!();
            println!("[info] Pong!");
            Sync::Ignored
        }
    };

    if outcome == Sync::Resync {
        if let Some(doc_id) = state_guard.doc_id.clone() {
            println!();
            println!("[sync] Out of step with the server, requesting snapshot");
            msg_tx.send(ClientMessage::RequestSnapshot { doc_id }).ok();
        }
    }

    prompt();
}
