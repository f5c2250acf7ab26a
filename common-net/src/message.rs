use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Role a peer plays inside a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Host,
    Viewer,
    #[default]
    Participant,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Host => "host",
            PeerRole::Viewer => "viewer",
            PeerRole::Participant => "participant",
        }
    }
}

/// Connection state of a peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Connecting or connected: the peer still holds a live slot.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Transitions a connection may request for its own slot. Re-asserting
    /// the current state is always allowed. Nothing leaves `Disconnected`
    /// here: a slot only comes back through reconnect reuse in the registry.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Connecting, Connected | Disconnected | Failed)
                | (Connected, Disconnected | Failed)
                | (Failed, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound message types understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Check,
    Offer,
    Answer,
    IceCandidate,
    PeerState,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Check => "check",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice_candidate",
            MessageKind::PeerState => "peer_state",
            MessageKind::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check" => Ok(MessageKind::Check),
            "offer" => Ok(MessageKind::Offer),
            "answer" => Ok(MessageKind::Answer),
            "ice_candidate" => Ok(MessageKind::IceCandidate),
            "peer_state" => Ok(MessageKind::PeerState),
            "heartbeat" => Ok(MessageKind::Heartbeat),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Message type is required")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("{0}")]
    MissingFields(&'static str),
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Partial update of the caller's own peer row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStateUpdate {
    #[serde(default)]
    pub connection_state: Option<ConnectionState>,
    #[serde(default)]
    pub has_video: Option<bool>,
    #[serde(default)]
    pub has_audio: Option<bool>,
    #[serde(default)]
    pub has_screen_share: Option<bool>,
}

impl PeerStateUpdate {
    pub fn is_empty(&self) -> bool {
        self.connection_state.is_none()
            && self.has_video.is_none()
            && self.has_audio.is_none()
            && self.has_screen_share.is_none()
    }
}

/// Decoded client -> server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Check { peer_role: PeerRole },
    Offer { to_peer_id: Uuid, sdp: Value },
    Answer { to_peer_id: Uuid, sdp: Value },
    IceCandidate { to_peer_id: Uuid, candidate: Value },
    PeerState(PeerStateUpdate),
    Heartbeat,
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Check { .. } => MessageKind::Check,
            ClientMessage::Offer { .. } => MessageKind::Offer,
            ClientMessage::Answer { .. } => MessageKind::Answer,
            ClientMessage::IceCandidate { .. } => MessageKind::IceCandidate,
            ClientMessage::PeerState(_) => MessageKind::PeerState,
            ClientMessage::Heartbeat => MessageKind::Heartbeat,
        }
    }

    /// Decodes one text frame: envelope first, then the `type` tag, then the
    /// fields that type requires. Unknown types and missing fields are
    /// reported separately.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::InvalidJson("expected a JSON object".into()));
        };

        let kind = match fields.remove("type") {
            Some(Value::String(tag)) => tag.parse::<MessageKind>()?,
            _ => return Err(ProtocolError::MissingType),
        };

        match kind {
            MessageKind::Check => {
                let peer_role = take_field::<PeerRole>(&mut fields, "peer_role")?
                    .ok_or(ProtocolError::MissingFields("peer_role is required"))?;
                Ok(ClientMessage::Check { peer_role })
            }
            MessageKind::Offer | MessageKind::Answer => {
                let to_peer_id = take_field::<Uuid>(&mut fields, "to_peer_id")?;
                let sdp = take_payload(&mut fields, "sdp");
                let (Some(to_peer_id), Some(sdp)) = (to_peer_id, sdp) else {
                    return Err(ProtocolError::MissingFields("to_peer_id and sdp are required"));
                };
                if kind == MessageKind::Offer {
                    Ok(ClientMessage::Offer { to_peer_id, sdp })
                } else {
                    Ok(ClientMessage::Answer { to_peer_id, sdp })
                }
            }
            MessageKind::IceCandidate => {
                let to_peer_id = take_field::<Uuid>(&mut fields, "to_peer_id")?;
                let candidate = take_payload(&mut fields, "candidate");
                let (Some(to_peer_id), Some(candidate)) = (to_peer_id, candidate) else {
                    return Err(ProtocolError::MissingFields(
                        "to_peer_id and candidate are required",
                    ));
                };
                Ok(ClientMessage::IceCandidate {
                    to_peer_id,
                    candidate,
                })
            }
            MessageKind::PeerState => {
                let update: PeerStateUpdate = serde_json::from_value(Value::Object(fields))
                    .map_err(|err| ProtocolError::InvalidField {
                        field: "peer_state",
                        reason: err.to_string(),
                    })?;
                if update.is_empty() {
                    return Err(ProtocolError::MissingFields(
                        "peer_state requires one of connection_state, has_video, has_audio, has_screen_share",
                    ));
                }
                Ok(ClientMessage::PeerState(update))
            }
            MessageKind::Heartbeat => Ok(ClientMessage::Heartbeat),
        }
    }
}

fn take_field<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    name: &'static str,
) -> Result<Option<T>, ProtocolError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| ProtocolError::InvalidField {
                field: name,
                reason: err.to_string(),
            }),
    }
}

// payloads are opaque; only absence matters
fn take_payload(fields: &mut Map<String, Value>, name: &str) -> Option<Value> {
    match fields.remove(name) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    }
}

/// One entry of an RTCPeerConnection `iceServers` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(
        rename = "credentialType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_type: Option<String>,
}

/// Peer entry in a `check.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub peer_role: PeerRole,
    pub connection_state: ConnectionState,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_screen_share: bool,
}

/// Server -> client message. Also the payload carried by the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection.established")]
    Established {
        peer_id: Uuid,
        client_peer_id: String,
        session_id: Uuid,
        user_id: i64,
        username: String,
        ice_servers: Vec<IceServer>,
        is_reconnection: bool,
    },
    #[serde(rename = "check.response")]
    CheckResponse { peers: Vec<PeerSummary> },
    #[serde(rename = "peer.check")]
    PeerCheck {
        from_peer_id: Uuid,
        from_user_id: i64,
        from_username: String,
        peer_role: PeerRole,
    },
    #[serde(rename = "offer")]
    Offer {
        from_peer_id: Uuid,
        from_user_id: i64,
        from_username: String,
        sdp: Value,
    },
    #[serde(rename = "answer")]
    Answer {
        from_peer_id: Uuid,
        from_user_id: i64,
        from_username: String,
        sdp: Value,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        from_peer_id: Uuid,
        from_user_id: i64,
        from_username: String,
        candidate: Value,
    },
    #[serde(rename = "peer.state_update")]
    PeerStateUpdate {
        peer_id: Uuid,
        user_id: i64,
        username: String,
        connection_state: ConnectionState,
        has_video: bool,
        has_audio: bool,
        has_screen_share: bool,
    },
    #[serde(rename = "heartbeat.response")]
    HeartbeatResponse { timestamp: DateTime<Utc> },
    #[serde(rename = "peer.joined")]
    PeerJoined {
        peer_id: Uuid,
        user_id: i64,
        username: String,
    },
    #[serde(rename = "peer.left")]
    PeerLeft {
        peer_id: Uuid,
        user_id: i64,
        username: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire tag, used as a metrics label.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Established { .. } => "connection.established",
            ServerMessage::CheckResponse { .. } => "check.response",
            ServerMessage::PeerCheck { .. } => "peer.check",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::PeerStateUpdate { .. } => "peer.state_update",
            ServerMessage::HeartbeatResponse { .. } => "heartbeat.response",
            ServerMessage::PeerJoined { .. } => "peer.joined",
            ServerMessage::PeerLeft { .. } => "peer.left",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
