//! Shared protocol definitions for hub ↔ participant signaling.
//! Keeping these in a dedicated crate lets the hub and the peer runtime
//! agree on the wire format without pulling in each other's runtime code.
//!
//! Every frame is a JSON object with a kebab-case `type` discriminator and
//! camelCase fields. Negotiation payloads (`sdp`, `candidate`) are carried as
//! opaque JSON values: the hub forwards them without looking inside.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Transport-level connection identifier, assigned by the hub per socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical sharing session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Stream publisher.
    Host,
    /// Stream consumer.
    Client,
}

impl Role {
    pub fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the member list handed to a joining connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: ConnectionId,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub role: Role,
}

/// The three negotiation payload kinds the hub relays point-to-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    /// Builds the frame delivered to the destination of a relayed payload.
    pub fn deliver(self, from: ConnectionId, payload: Value, session_id: SessionId) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::Offer {
                from,
                sdp: payload,
                session_id,
            },
            SignalKind::Answer => ServerMessage::Answer {
                from,
                sdp: payload,
                session_id,
            },
            SignalKind::IceCandidate => ServerMessage::IceCandidate {
                from,
                candidate: payload,
                session_id,
            },
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from a participant to the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: SessionId,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        role: Role,
    },
    /// The session is inferred from the connection's current association.
    LeaveSession,
    #[serde(rename_all = "camelCase")]
    Offer {
        to: ConnectionId,
        sdp: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        to: ConnectionId,
        sdp: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        to: ConnectionId,
        candidate: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped { session_id: SessionId },
    /// Heartbeat to keep the connection alive.
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::LeaveSession => "leave-session",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::ScreenShareStarted { .. } => "screen-share-started",
            ClientMessage::ScreenShareStopped { .. } => "screen-share-stopped",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the hub to a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_id: SessionId,
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        connection_id: ConnectionId,
        user_id: String,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    Offer {
        from: ConnectionId,
        sdp: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from: ConnectionId,
        sdp: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from: ConnectionId,
        candidate: Value,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted {
        host_id: ConnectionId,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped {
        host_id: ConnectionId,
        session_id: SessionId,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded { session_id: SessionId },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionJoined { .. } => "session-joined",
            ServerMessage::ParticipantJoined { .. } => "participant-joined",
            ServerMessage::ParticipantLeft { .. } => "participant-left",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::ScreenShareStarted { .. } => "screen-share-started",
            ServerMessage::ScreenShareStopped { .. } => "screen-share-stopped",
            ServerMessage::SessionEnded { .. } => "session-ended",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the shape browsers use for `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}

/// Connectivity candidate in the shape browsers use for `RTCIceCandidateInit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}
