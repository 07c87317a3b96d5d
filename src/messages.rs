use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message types we accept; anything else is dropped as unknown.
const CLIENT_TYPES: &[&str] = &[
    "join-room",
    "leave-room",
    "offer",
    "answer",
    "ice-candidate",
    "heartbeat",
];

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Inbound envelopes. The `offer`/`answer`/`candidate` payloads are opaque
/// to the relay and forwarded verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom { room_id: String, user_id: String },
    #[serde(rename = "leave-room", rename_all = "camelCase")]
    LeaveRoom { room_id: String, user_id: String },
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer {
        room_id: String,
        sender: String,
        offer: Value,
    },
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        room_id: String,
        sender: String,
        answer: Value,
    },
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        room_id: String,
        sender: String,
        candidate: Value,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl ClientMessage {
    /// Decode one inbound envelope. Distinguishes malformed JSON, a missing
    /// or unknown `type`, and a known type with bad fields so the caller can
    /// log something useful before dropping the message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned();
        serde_json::from_value(value).map_err(|source| {
            if CLIENT_TYPES.contains(&kind.as_str()) {
                ProtocolError::InvalidPayload { kind, source }
            } else {
                ProtocolError::UnknownType(kind)
            }
        })
    }
}

/// Outbound envelopes. Relayed messages keep the sender but drop the room id;
/// the recipient already knows which room its connection is signaling for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "peer-joined", rename_all = "camelCase")]
    PeerJoined { room_id: String, user_id: String },
    #[serde(rename = "peer-left", rename_all = "camelCase")]
    PeerLeft { room_id: String, user_id: String },
    #[serde(rename = "offer")]
    Offer { sender: String, offer: Value },
    #[serde(rename = "answer")]
    Answer { sender: String, answer: Value },
    #[serde(rename = "ice-candidate")]
    IceCandidate { sender: String, candidate: Value },
    #[serde(rename = "heartbeat-ack")]
    HeartbeatAck,
}
