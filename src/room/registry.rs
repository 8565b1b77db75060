//! Connection and room membership registry
//!
//! Every connection registers an outbox when it opens. Rooms are created
//! implicitly by the first join and dropped when the last member leaves.

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::participant::{Identity, Participant};
use crate::protocol::ServerEvent;

pub type ConnectionId = Uuid;

/// Sending half of a connection's outbound queue
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Who receives a room broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every member, including the originator
    Room,
    /// Every member except the given connection
    RoomExcept(ConnectionId),
}

struct Connection {
    identity: Identity,
    outbox: Outbox,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, HashMap<ConnectionId, Participant>>,
}

/// Registry of live connections and the rooms they joined
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id
    pub async fn connect(&self, identity: Identity, outbox: Outbox) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            Connection {
                identity,
                outbox,
                rooms: HashSet::new(),
            },
        );
        id
    }

    /// Drop a connection and its memberships; returns the rooms it was in
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.remove(&connection_id) else {
            return Vec::new();
        };

        let rooms: Vec<String> = connection.rooms.into_iter().collect();
        for room_id in &rooms {
            remove_member(&mut inner.rooms, room_id, connection_id);
        }
        rooms
    }

    /// Add a connection to a room. Joining twice keeps a single membership.
    ///
    /// Returns the participant list after the join, or `None` if the
    /// connection is unknown.
    pub async fn join(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Vec<Participant>> {
        let mut inner = self.inner.write().await;
        let Inner { connections, rooms } = &mut *inner;

        let connection = connections.get_mut(&connection_id)?;
        connection.rooms.insert(room_id.to_string());

        let members = rooms.entry(room_id.to_string()).or_default();
        members
            .entry(connection_id)
            .and_modify(Participant::touch)
            .or_insert_with(|| Participant::new(connection_id, &connection.identity));

        Some(members.values().cloned().collect())
    }

    /// Remove a connection from one room
    pub async fn leave(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let was_member = inner
            .connections
            .get_mut(&connection_id)
            .map(|c| c.rooms.remove(room_id))
            .unwrap_or(false);

        if was_member {
            remove_member(&mut inner.rooms, room_id, connection_id);
        }
        was_member
    }

    pub async fn is_member(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains_key(&connection_id))
    }

    /// Record activity for a member
    pub async fn touch(&self, room_id: &str, connection_id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(participant) = inner
            .rooms
            .get_mut(room_id)
            .and_then(|members| members.get_mut(&connection_id))
        {
            participant.touch();
        }
    }

    pub async fn participants(&self, room_id: &str) -> Vec<Participant> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an event to room members; returns how many outboxes accepted it
    pub async fn broadcast(&self, room_id: &str, event: &ServerEvent, scope: Scope) -> usize {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for connection_id in members.keys() {
            if scope == Scope::RoomExcept(*connection_id) {
                continue;
            }
            let Some(connection) = inner.connections.get(connection_id) else {
                continue;
            };
            if connection.outbox.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(%connection_id, room_id, "Outbox closed, skipping");
            }
        }
        delivered
    }

    /// Send an event to a single connection
    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&connection_id)
            .is_some_and(|c| c.outbox.send(event).is_ok())
    }

    /// Whether the room still has at least one member
    pub async fn has_room(&self, room_id: &str) -> bool {
        self.inner.read().await.rooms.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

fn remove_member(
    rooms: &mut HashMap<String, HashMap<ConnectionId, Participant>>,
    room_id: &str,
    connection_id: ConnectionId,
) {
    if let Some(members) = rooms.get_mut(room_id) {
        members.remove(&connection_id);
        if members.is_empty() {
            rooms.remove(room_id);
        }
    }
}
