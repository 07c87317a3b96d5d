//! In-memory signaling relay for peer-to-peer sessions: tracks which
//! connections belong to which rooms and fans session-negotiation messages
//! out to room peers, excluding the sender. Payloads are relayed opaquely.

pub mod messages;
pub mod registry;
pub mod server;
