// WebSocket server: authentication, connection loop and message dispatch

use crate::auth::{Credentials, Principal, SessionResolver, TokenQuery};
use crate::error::SyncError;
use crate::gateway::SharedGateway;
use crate::room::Member;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, Request, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use futures_util::{SinkExt, StreamExt}; // For split() and next()
use ot::SessionId;
use protocol::{ClientMessage, Collaborator, ServerMessage};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// Server state shared across connections
#[derive(Clone)]
pub struct ServerState {
    gateway: SharedGateway,

    // Validates connection credentials
    sessions: Arc<dyn SessionResolver>,

    // Session ids are handed out per connection and never reused
    next_session: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(gateway: SharedGateway, sessions: Arc<dyn SessionResolver>) -> Self {
        ServerState {
            gateway,
            sessions,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    fn allocate_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

// Reject the upgrade unless the request carries a valid session
async fn require_session(
    State(state): State<ServerState>,
    Query(query): Query<TokenQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = Credentials::from_request(request.headers(), &query);

    match state.sessions.resolve(&credentials).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(SyncError::Unauthenticated) => {
            tracing::debug!("Rejected unauthenticated connection");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(err) => {
            tracing::error!("Session lookup failed: {}", err);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

// Handle WebSocket upgrade
pub async fn websocket_handler(
    State(state): State<ServerState>,
    Extension(principal): Extension<Principal>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: ServerState, principal: Principal) {
    let me = Collaborator {
        session_id: state.allocate_session(),
        user_id: principal.user_id,
        joined_at: chrono::Utc::now(),
    };
    tracing::info!(
        "New WebSocket connection: session {} ({})",
        me.session_id,
        me.user_id
    );

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // SEND TASK: ServerMessage -> JSON -> Text frame, in channel order
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize ServerMessage: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut joined: HashSet<String> = HashSet::new();

    // Receiving loop
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => {
                    if let Err(e) =
                        handle_client_message(&state, &me, &tx, client_msg, &mut joined).await
                    {
                        tracing::warn!("Error handling message from {}: {}", me.session_id, e);
                        let _ = tx.send(ServerMessage::Error {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse ClientMessage: {}", e);
                    let _ = tx.send(ServerMessage::Error {
                        kind: protocol::ErrorKind::Validation,
                        message: format!("Invalid message format: {}", e),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {} // Ping/pong frames are answered by axum
        }
    }

    // Cleanup on disconnect
    for doc_id in joined {
        if let Err(e) = state.gateway.leave(&doc_id, me.session_id).await {
            tracing::warn!("Cleanup of {} for {} failed: {}", doc_id, me.session_id, e);
        }
    }

    send_task.abort();
    tracing::info!("WebSocket connection closed: session {}", me.session_id);
}

// Handle a client message
async fn handle_client_message(
    state: &ServerState,
    me: &Collaborator,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
    joined: &mut HashSet<String>,
) -> Result<(), SyncError> {
    match message {
        ClientMessage::JoinDocument {
            doc_id,
            since_version,
        } => {
            let member = Member::new(me.session_id, me.user_id.clone(), tx.clone());
            state
                .gateway
                .subscribe(&doc_id, member, since_version)
                .await?;
            joined.insert(doc_id);
        }

        ClientMessage::LeaveDocument { doc_id } => {
            state.gateway.leave(&doc_id, me.session_id).await?;
            joined.remove(&doc_id);
        }

        ClientMessage::SubmitOperation { doc_id, operation } => {
            // Success is acknowledged by the gateway through the room
            if let Err(err) = state
                .gateway
                .submit_operation(&doc_id, me, &operation)
                .await
            {
                tracing::debug!(
                    "Rejected operation {} from {} on {}: {}",
                    operation.client_seq,
                    me.session_id,
                    doc_id,
                    err
                );
                let _ = tx.send(ServerMessage::Rejected {
                    doc_id,
                    client_seq: operation.client_seq,
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }

        ClientMessage::RequestSnapshot { doc_id } => {
            state.gateway.resync(&doc_id, me.session_id).await?;
        }

        ClientMessage::ListCollaborators { doc_id } => {
            let collaborators = state.gateway.collaborators(&doc_id, me.session_id).await?;
            let _ = tx.send(ServerMessage::Collaborators {
                doc_id,
                collaborators,
            });
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }

    Ok(())
}

// Build the router
pub fn router(state: ServerState) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}

// Create and configure the server
pub async fn create_server(state: ServerState, addr: SocketAddr) -> Result<()> {
    tracing::info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, state).await
}
