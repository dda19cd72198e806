//! JSON event protocol for room presence and buffer relay.
//!
//! Every frame is a single WebSocket text message:
//! ```text
//! { "event": "<name>", "data": { ...payload... } }
//! ```
//!
//! | Event          | Direction              | Payload                               |
//! |----------------|------------------------|---------------------------------------|
//! | `join`         | client → server        | `{roomId, username}`                  |
//! | `joined`       | server → room          | `{clients, username, socketId}`       |
//! | `code-change`  | both                   | `{roomId, code}` / `{code}`           |
//! | `sync-code`    | client → server        | `{socketId, code}`                    |
//! | `disconnected` | server → room          | `{socketId, username}`                |
//!
//! Payload fields that a client leaves out decode as absent values instead of
//! failing the whole frame.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Wire names of every event.
pub mod actions {
    pub const CONNECTED: &str = "connected";
    pub const JOIN: &str = "join";
    pub const JOINED: &str = "joined";
    pub const CODE_CHANGE: &str = "code-change";
    pub const SYNC_CODE: &str = "sync-code";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Opaque transport-assigned connection identifier (`socketId` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate a fresh identifier for a newly accepted connection.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen room name. Never validated.
pub type RoomId = String;

/// Membership record: a connection paired with the name it joined under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub socket_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Treat an explicit `null` like an absent string.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChangePayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCodePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join(JoinPayload),
    #[serde(rename = "code-change")]
    CodeChange(CodeChangePayload),
    #[serde(rename = "sync-code")]
    SyncCode(SyncCodePayload),
}

impl ClientEvent {
    pub fn join(room_id: impl Into<RoomId>, username: impl Into<String>) -> Self {
        Self::Join(JoinPayload {
            room_id: room_id.into(),
            username: Some(username.into()),
        })
    }

    pub fn code_change(room_id: impl Into<RoomId>, code: impl Into<String>) -> Self {
        Self::CodeChange(CodeChangePayload {
            room_id: room_id.into(),
            code: Some(code.into()),
        })
    }

    pub fn sync_code(target: ConnectionId, code: impl Into<String>) -> Self {
        Self::SyncCode(SyncCodePayload {
            socket_id: Some(target),
            code: Some(code.into()),
        })
    }

    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => actions::JOIN,
            Self::CodeChange(_) => actions::CODE_CHANGE,
            Self::SyncCode(_) => actions::SYNC_CODE,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Events the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Transport handshake telling a fresh connection its own id.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { socket_id: ConnectionId },

    /// Membership snapshot after a join, sent to the whole room.
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined {
        clients: Vec<ClientInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        socket_id: ConnectionId,
    },

    /// Buffer contents relayed from a peer.
    #[serde(rename = "code-change")]
    CodeChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Departure notice for the remaining members of a room.
    #[serde(rename = "disconnected", rename_all = "camelCase")]
    Disconnected {
        socket_id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => actions::CONNECTED,
            Self::Joined { .. } => actions::JOINED,
            Self::CodeChange { .. } => actions::CODE_CHANGE,
            Self::Disconnected { .. } => actions::DISCONNECTED,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
