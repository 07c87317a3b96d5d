use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::{Connection, Registry};

/// Shared handle to the relay. Cloned into every connection task; the
/// registry behind the lock is the only mutable state in the process.
#[derive(Clone)]
pub struct Server {
    registry: Arc<RwLock<Registry>>,
}

impl Server {
    pub fn new() -> Self {
        Server {
            registry: Arc::new(RwLock::new(Registry::new())),
        }
    }

    pub async fn stats(&self) -> (usize, usize) {
        let registry = self.registry.read().await;
        (registry.room_count(), registry.member_count())
    }

    /// Drives one websocket for its whole life: send the `connected` ack,
    /// dispatch inbound messages in order, and clean up memberships once the
    /// socket closes or errors out.
    pub async fn handle_connection(&self, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new(tx);
        info!("connection {} open", connection.id());

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        connection.send(&ServerMessage::Connected);

        while let Some(result) = ws_rx.next().await {
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    warn!("connection {}: websocket error: {}", connection.id(), e);
                    break;
                }
            };
            // Ping/pong/close frames are the transport's business.
            let Ok(text) = message.to_str() else {
                continue;
            };
            match ClientMessage::parse(text) {
                Ok(client_message) => self.handle_message(&connection, client_message).await,
                Err(e) => {
                    warn!("connection {}: dropping message: {}", connection.id(), e);
                }
            }
        }

        self.handle_disconnect(&connection).await;
        info!("connection {} closed", connection.id());
    }

    /// Dispatch one decoded envelope. Joins and leaves announce themselves to
    /// the rest of the room under the same write-lock hold as the mutation,
    /// so no broadcast can observe a room mid-change.
    async fn handle_message(&self, connection: &Connection, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id, user_id } => {
                debug!(
                    "connection {} joins room {room_id:?} as {user_id:?}",
                    connection.id()
                );
                let mut registry = self.registry.write().await;
                registry.join(room_id.clone(), user_id.clone(), connection.clone());
                registry.broadcast(
                    &room_id,
                    &ServerMessage::PeerJoined {
                        room_id: room_id.clone(),
                        user_id,
                    },
                    connection.id(),
                );
            }
            ClientMessage::LeaveRoom { room_id, user_id } => {
                debug!(
                    "connection {} leaves room {room_id:?} as {user_id:?}",
                    connection.id()
                );
                let mut registry = self.registry.write().await;
                if registry.leave(&room_id, &user_id) {
                    registry.broadcast(
                        &room_id,
                        &ServerMessage::PeerLeft {
                            room_id: room_id.clone(),
                            user_id,
                        },
                        connection.id(),
                    );
                }
            }
            ClientMessage::Offer {
                room_id,
                sender,
                offer,
            } => {
                let registry = self.registry.read().await;
                registry.broadcast(
                    &room_id,
                    &ServerMessage::Offer { sender, offer },
                    connection.id(),
                );
            }
            ClientMessage::Answer {
                room_id,
                sender,
                answer,
            } => {
                let registry = self.registry.read().await;
                registry.broadcast(
                    &room_id,
                    &ServerMessage::Answer { sender, answer },
                    connection.id(),
                );
            }
            ClientMessage::IceCandidate {
                room_id,
                sender,
                candidate,
            } => {
                let registry = self.registry.read().await;
                registry.broadcast(
                    &room_id,
                    &ServerMessage::IceCandidate { sender, candidate },
                    connection.id(),
                );
            }
            ClientMessage::Heartbeat => connection.send(&ServerMessage::HeartbeatAck),
        }
    }

    /// Same removal + departure notice as an explicit leave, once per room
    /// the connection occupies. The `leave` return value guards against a
    /// second `peer-left` when an explicit leave already ran.
    async fn handle_disconnect(&self, connection: &Connection) {
        let mut registry = self.registry.write().await;
        for (room_id, user_id) in registry.find_memberships(connection.id()) {
            if registry.leave(&room_id, &user_id) {
                registry.broadcast(
                    &room_id,
                    &ServerMessage::PeerLeft {
                        room_id: room_id.clone(),
                        user_id,
                    },
                    connection.id(),
                );
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

/// Websocket upgrade at `/ws`, status JSON at `/status`, permissive CORS over
/// everything. Non-upgrade requests never reach the relay core.
pub fn routes(
    server: Server,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_server = server.clone();
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let server = ws_server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let status_route = warp::path("status").and(warp::get()).and_then(move || {
        let server = server.clone();
        async move {
            let (rooms, connections) = server.stats().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                "status": "ok",
                "rooms": rooms,
                "connections": connections,
            })))
        }
    });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    ws_route.or(status_route).with(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connection() -> (Connection, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Value> {
        let mut received = Vec::new();
        while let Ok(message) = rx.try_recv() {
            let text = message.to_str().expect("text frame");
            received.push(serde_json::from_str(text).expect("valid JSON"));
        }
        received
    }

    async fn join(server: &Server, connection: &Connection, room_id: &str, user_id: &str) {
        server
            .handle_message(
                connection,
                ClientMessage::JoinRoom {
                    room_id: room_id.to_owned(),
                    user_id: user_id.to_owned(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn join_notifies_existing_peers_but_not_the_joiner() {
        let server = Server::new();
        let (alice, mut alice_rx) = connection();
        let (bob, mut bob_rx) = connection();

        join(&server, &alice, "lobby", "alice").await;
        assert!(drain(&mut alice_rx).is_empty());

        join(&server, &bob, "lobby", "bob").await;
        assert_eq!(
            drain(&mut alice_rx),
            vec![json!({"type": "peer-joined", "roomId": "lobby", "userId": "bob"})]
        );
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn offer_is_relayed_to_peers_only() {
        let server = Server::new();
        let (alice, mut alice_rx) = connection();
        let (bob, mut bob_rx) = connection();
        join(&server, &alice, "lobby", "alice").await;
        join(&server, &bob, "lobby", "bob").await;
        drain(&mut alice_rx);

        server
            .handle_message(
                &alice,
                ClientMessage::Offer {
                    room_id: "lobby".to_owned(),
                    sender: "alice".to_owned(),
                    offer: json!({"sdp": "v=0"}),
                },
            )
            .await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![json!({"type": "offer", "sender": "alice", "offer": {"sdp": "v=0"}})]
        );
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn last_leave_deletes_room_and_later_relay_is_a_noop() {
        let server = Server::new();
        let (alice, mut alice_rx) = connection();
        join(&server, &alice, "lobby", "alice").await;

        server
            .handle_message(
                &alice,
                ClientMessage::LeaveRoom {
                    room_id: "lobby".to_owned(),
                    user_id: "alice".to_owned(),
                },
            )
            .await;
        assert_eq!(server.stats().await, (0, 0));

        server
            .handle_message(
                &alice,
                ClientMessage::Answer {
                    room_id: "lobby".to_owned(),
                    sender: "alice".to_owned(),
                    answer: json!({"sdp": "v=0"}),
                },
            )
            .await;
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn disconnect_cleans_every_membership() {
        let server = Server::new();
        let (closing, _closing_rx) = connection();
        let (peer_a, mut peer_a_rx) = connection();
        let (peer_b, mut peer_b_rx) = connection();
        join(&server, &peer_a, "a", "pa").await;
        join(&server, &peer_b, "b", "pb").await;
        join(&server, &closing, "a", "u1").await;
        join(&server, &closing, "b", "u2").await;
        drain(&mut peer_a_rx);
        drain(&mut peer_b_rx);

        server.handle_disconnect(&closing).await;

        assert_eq!(
            drain(&mut peer_a_rx),
            vec![json!({"type": "peer-left", "roomId": "a", "userId": "u1"})]
        );
        assert_eq!(
            drain(&mut peer_b_rx),
            vec![json!({"type": "peer-left", "roomId": "b", "userId": "u2"})]
        );
        assert_eq!(server.stats().await, (2, 2));
    }

    #[tokio::test]
    async fn explicit_leave_then_disconnect_announces_departure_once() {
        let server = Server::new();
        let (alice, _alice_rx) = connection();
        let (bob, mut bob_rx) = connection();
        join(&server, &alice, "lobby", "alice").await;
        join(&server, &bob, "lobby", "bob").await;

        server
            .handle_message(
                &alice,
                ClientMessage::LeaveRoom {
                    room_id: "lobby".to_owned(),
                    user_id: "alice".to_owned(),
                },
            )
            .await;
        server.handle_disconnect(&alice).await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![json!({"type": "peer-left", "roomId": "lobby", "userId": "alice"})]
        );
    }

    #[tokio::test]
    async fn heartbeat_acks_the_sender_only() {
        let server = Server::new();
        let (alice, mut alice_rx) = connection();
        let (bob, mut bob_rx) = connection();
        join(&server, &alice, "lobby", "alice").await;
        join(&server, &bob, "lobby", "bob").await;
        drain(&mut alice_rx);

        server.handle_message(&alice, ClientMessage::Heartbeat).await;

        assert_eq!(drain(&mut alice_rx), vec![json!({"type": "heartbeat-ack"})]);
        assert!(drain(&mut bob_rx).is_empty());
    }
}
