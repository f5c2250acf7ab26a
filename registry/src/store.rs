use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_net::message::{ConnectionState, PeerRole};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    MediaUpdate, NewSession, NewSignal, Peer, PeerClaim, PeerSlot, ResourceRef, Session,
    SessionKind, Signal,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("session {0} already exists")]
    SessionExists(Uuid),
    #[error("peer {0} not found")]
    PeerNotFound(Uuid),
    #[error("peer {0} is held by a newer connection")]
    Superseded(Uuid),
    #[error("invalid connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of sessions, peers and the signal audit log.
///
/// Every mutation touches a single row. Peer writes name the connection that
/// issues them and fail with `Superseded` once a reconnect has handed the
/// row to another connection. Reuse of a disconnected slot must be an atomic
/// find-and-flip so that two racing reconnects cannot both win, and it is the
/// only way out of `Disconnected`. The three reaper writes re-check their
/// filter on each row as they apply it.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Fails with `SessionExists` when `new.id` is already taken.
    async fn create_session(&self, new: NewSession) -> Result<Session, RegistryError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Session, RegistryError>;

    /// Live default session linked to `resource`, created on first use.
    async fn default_session(
        &self,
        resource: &ResourceRef,
        initiator_id: i64,
        kind: SessionKind,
    ) -> Result<Session, RegistryError>;

    /// waiting -> active. Returns whether the row changed.
    async fn activate_session(&self, session_id: Uuid) -> Result<bool, RegistryError>;

    /// Terminal. Ending twice keeps the first `ended_at`.
    async fn end_session(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Session, RegistryError>;

    async fn create_or_reuse_peer(&self, claim: PeerClaim) -> Result<PeerSlot, RegistryError>;

    async fn get_peer(&self, peer_id: Uuid) -> Result<Peer, RegistryError>;

    async fn set_state(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        state: ConnectionState,
    ) -> Result<Peer, RegistryError>;

    async fn set_role(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        role: PeerRole,
    ) -> Result<Peer, RegistryError>;

    async fn set_media(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        update: MediaUpdate,
    ) -> Result<Peer, RegistryError>;

    async fn touch(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Peers in connecting/connected, oldest first.
    async fn list_active_peers(
        &self,
        session_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Peer>, RegistryError>;

    async fn record_signal(&self, new: NewSignal) -> Result<Signal, RegistryError>;

    async fn list_signals(&self, session_id: Uuid) -> Result<Vec<Signal>, RegistryError>;

    /// Flips active peers whose heartbeat is older than `cutoff` to
    /// disconnected and returns the rows this call flipped.
    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Peer>, RegistryError>;

    /// Deletes disconnected peers last seen before `cutoff`.
    async fn purge_disconnected(&self, cutoff: DateTime<Utc>) -> Result<usize, RegistryError>;

    /// Deletes sessions ended before `cutoff` with their peers and signals.
    async fn purge_ended_sessions(&self, cutoff: DateTime<Utc>) -> Result<usize, RegistryError>;
}
