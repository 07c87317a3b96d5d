use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use warp::ws::Message;

use crate::messages::ServerMessage;

/// Non-owning handle to one participant's outbound channel. The websocket
/// writer task owns the socket; the registry only keeps clones of this.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    tx: UnboundedSender<Message>,
}

impl Connection {
    /// Assigns a fresh process-unique id at accept time.
    pub fn new(tx: UnboundedSender<Message>) -> Self {
        Connection {
            id: Uuid::new_v4().to_string(),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fire-and-forget delivery. A failed send means the writer task is gone;
    /// the close path will remove the connection, so the error is swallowed.
    pub fn send(&self, message: &ServerMessage) {
        if let Ok(json) = serde_json::to_string(message) {
            let _ = self.tx.send(Message::text(json));
        }
    }

    fn send_text(&self, text: &str) {
        let _ = self.tx.send(Message::text(text.to_owned()));
    }
}

/// Room membership state: room id -> (user id -> connection).
///
/// A room exists here iff it has at least one member; the last leave deletes
/// the entry. Callers serialize access through the server's lock.
#[derive(Default)]
pub struct Registry {
    rooms: HashMap<String, HashMap<String, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Inserts the user into the room, creating the room if needed. A second
    /// join with the same (room, user) silently replaces the old connection.
    pub fn join(&mut self, room_id: String, user_id: String, connection: Connection) {
        self.rooms
            .entry(room_id)
            .or_default()
            .insert(user_id, connection);
    }

    /// Removes the user from the room and deletes the room once empty.
    /// Returns whether anything was removed; callers use that to decide
    /// whether a departure should be announced, which also keeps an explicit
    /// leave racing against disconnect cleanup down to a single broadcast.
    pub fn leave(&mut self, room_id: &str, user_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(user_id).is_some();
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }

    /// Every (room, user) pair the connection currently occupies. Normally
    /// one, but zero or several are tolerated and cleaned up the same way.
    pub fn find_memberships(&self, connection_id: &str) -> Vec<(String, String)> {
        self.rooms
            .iter()
            .flat_map(|(room_id, members)| {
                members
                    .iter()
                    .filter(|(_, connection)| connection.id == connection_id)
                    .map(move |(user_id, _)| (room_id.clone(), user_id.clone()))
            })
            .collect()
    }

    /// Serializes the message once and sends it to every member of the room
    /// except the excluded connection. Unknown room is a no-op; per-recipient
    /// send failures are swallowed.
    pub fn broadcast(&self, room_id: &str, message: &ServerMessage, exclude_id: &str) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        let Ok(json) = serde_json::to_string(message) else {
            return;
        };
        for connection in members.values() {
            if connection.id != exclude_id {
                connection.send_text(&json);
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.rooms.values().map(HashMap::len).sum()
    }
}
