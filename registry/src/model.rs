use chrono::{DateTime, Utc};
use common_net::message::{ConnectionState, PeerRole, PeerSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    VideoCall,
    AudioCall,
    ScreenShare,
    DataChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

/// Reference to an authorization record owned by the external record system
/// (a lab group, an instrument booking, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: Option<String>,
    pub is_default: bool,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub initiator_id: i64,
    pub linked_resources: Vec<ResourceRef>,
    pub configuration: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Id assigned by the external record system; generated when absent.
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub kind: SessionKind,
    pub initiator_id: i64,
    pub linked_resources: Vec<ResourceRef>,
    pub is_default: bool,
    pub configuration: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub has_video: bool,
    pub has_audio: bool,
    pub has_screen_share: bool,
}

/// Partial media update; `None` leaves the flag alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaUpdate {
    pub has_video: Option<bool>,
    pub has_audio: Option<bool>,
    pub has_screen_share: Option<bool>,
}

impl MediaUpdate {
    pub fn is_empty(&self) -> bool {
        self.has_video.is_none() && self.has_audio.is_none() && self.has_screen_share.is_none()
    }

    pub fn apply(&self, flags: &mut MediaFlags) {
        if let Some(v) = self.has_video {
            flags.has_video = v;
        }
        if let Some(v) = self.has_audio {
            flags.has_audio = v;
        }
        if let Some(v) = self.has_screen_share {
            flags.has_screen_share = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: i64,
    pub username: String,
    /// Reconnection token held by the client.
    pub client_peer_id: Option<String>,
    /// Fresh on every connect; doubles as the fabric subscriber id.
    pub connection_id: Uuid,
    pub role: PeerRole,
    pub state: ConnectionState,
    pub media: MediaFlags,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<&Peer> for PeerSummary {
    fn from(peer: &Peer) -> Self {
        PeerSummary {
            peer_id: peer.id,
            user_id: peer.user_id,
            username: peer.username.clone(),
            peer_role: peer.role,
            connection_state: peer.state,
            has_video: peer.media.has_video,
            has_audio: peer.media.has_audio,
            has_screen_share: peer.media.has_screen_share,
        }
    }
}

/// Who is connecting, and with which reconnection token.
#[derive(Debug, Clone)]
pub struct PeerClaim {
    pub session_id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub client_peer_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeerSlot {
    pub peer: Peer,
    pub reconnected: bool,
    /// Connection that held the slot before a reconnect took it over.
    pub replaced_connection: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Check,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice_candidate",
            SignalType::Check => "check",
        }
    }
}

/// Audit row for one relayed message. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub session_id: Uuid,
    pub from_peer_id: Uuid,
    pub to_peer_id: Option<Uuid>,
    pub signal_type: SignalType,
    pub payload: serde_json::Value,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSignal {
    pub session_id: Uuid,
    pub from_peer_id: Uuid,
    pub to_peer_id: Option<Uuid>,
    pub signal_type: SignalType,
    pub payload: serde_json::Value,
    pub delivered: bool,
}
