// Room management: which sessions are editing which document

use ot::SessionId;
use protocol::{Collaborator, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// A session connected to a room
#[derive(Debug, Clone)]
pub struct Member {
    pub collaborator: Collaborator,
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Member {
    pub fn new(
        session_id: SessionId,
        user_id: impl Into<String>,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Member {
            collaborator: Collaborator {
                session_id,
                user_id: user_id.into(),
                joined_at: chrono::Utc::now(),
            },
            sender,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.collaborator.session_id
    }
}

/// Sessions currently editing one document
#[derive(Debug)]
pub struct Room {
    /// Document ID
    pub doc_id: String,

    /// Connected members
    members: HashMap<SessionId, Member>,
}

impl Room {
    fn new(doc_id: &str) -> Self {
        Room {
            doc_id: doc_id.to_string(),
            members: HashMap::new(),
        }
    }

    /// Broadcast message to all members except one; returns how many got it
    fn broadcast_except(&self, except: Option<SessionId>, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        for (id, member) in &self.members {
            if Some(*id) == except {
                continue;
            }
            // A closed channel means the connection is going away; it will leave shortly
            if member.sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!("Dropped message for departing session {}", id);
            }
        }
        delivered
    }

    fn collaborators(&self) -> Vec<Collaborator> {
        let mut list: Vec<_> = self
            .members
            .values()
            .map(|member| member.collaborator.clone())
            .collect();
        list.sort_by_key(|c| c.session_id);
        list
    }
}

/// Per-document membership. A room exists only while it has members.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room on first join. Other members are told.
    pub async fn join(&self, doc_id: &str, member: Member) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Room::new(doc_id));

        let collaborator = member.collaborator.clone();
        room.members.insert(member.session_id(), member);

        room.broadcast_except(
            Some(collaborator.session_id),
            &ServerMessage::UserJoined {
                doc_id: doc_id.to_string(),
                collaborator: collaborator.clone(),
            },
        );

        tracing::info!(
            "Session {} ({}) joined {} ({} members)",
            collaborator.session_id,
            collaborator.user_id,
            doc_id,
            room.members.len()
        );
    }

    /// Remove a member; returns whether the room is now gone.
    /// None if the session was not a member.
    pub async fn leave(&self, doc_id: &str, session_id: SessionId) -> Option<bool> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(doc_id)?;
        let member = room.members.remove(&session_id)?;

        room.broadcast_except(
            None,
            &ServerMessage::UserLeft {
                doc_id: doc_id.to_string(),
                collaborator: member.collaborator.clone(),
            },
        );
        tracing::info!("Session {} left {}", session_id, doc_id);

        if room.members.is_empty() {
            rooms.remove(doc_id);
            tracing::debug!("Room {} is empty, removed", doc_id);
            return Some(true);
        }
        Some(false)
    }

    /// Best-effort fan-out; failures are swallowed. Returns the delivered count.
    pub async fn broadcast(
        &self,
        doc_id: &str,
        message: &ServerMessage,
        exclude: Option<SessionId>,
    ) -> usize {
        match self.rooms.read().await.get(doc_id) {
            Some(room) => room.broadcast_except(exclude, message),
            None => 0,
        }
    }

    /// Send message to one member; false if it is not a member or has gone away
    pub async fn send_to(&self, doc_id: &str, session_id: SessionId, message: ServerMessage) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(doc_id)
            .and_then(|room| room.members.get(&session_id))
            .map(|member| member.sender.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Members ordered by session id
    pub async fn members(&self, doc_id: &str) -> Vec<Collaborator> {
        self.rooms
            .read()
            .await
            .get(doc_id)
            .map(Room::collaborators)
            .unwrap_or_default()
    }

    pub async fn is_member(&self, doc_id: &str, session_id: SessionId) -> bool {
        self.rooms
            .read()
            .await
            .get(doc_id)
            .is_some_and(|room| room.members.contains_key(&session_id))
    }

    pub async fn is_active(&self, doc_id: &str) -> bool {
        self.rooms.read().await.contains_key(doc_id)
    }
}
