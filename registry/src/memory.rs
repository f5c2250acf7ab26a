use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_net::message::{ConnectionState, PeerRole};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;
use uuid::Uuid;

use crate::model::{
    MediaFlags, MediaUpdate, NewSession, NewSignal, Peer, PeerClaim, PeerSlot, ResourceRef,
    Session, SessionKind, SessionStatus, Signal,
};
use crate::store::{RegistryError, SignalStore};

/// Arena-of-rows store. Each row sits behind its shard lock, so every
/// mutation below is a single-row update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<Uuid, Session>,
    defaults: DashMap<ResourceRef, Uuid>,
    peers: DashMap<Uuid, Peer>,
    signals: DashMap<Uuid, Vec<Signal>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn build_session(new: NewSession) -> Session {
        Session {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            name: new.name,
            is_default: new.is_default,
            kind: new.kind,
            status: SessionStatus::Waiting,
            initiator_id: new.initiator_id,
            linked_resources: new.linked_resources,
            configuration: new
                .configuration
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn update_peer<F>(&self, peer_id: Uuid, connection_id: Uuid, f: F) -> Result<Peer, RegistryError>
    where
        F: FnOnce(&mut Peer) -> Result<(), RegistryError>,
    {
        let mut peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or(RegistryError::PeerNotFound(peer_id))?;
        if peer.connection_id != connection_id {
            return Err(RegistryError::Superseded(peer_id));
        }
        f(&mut peer)?;
        Ok(peer.clone())
    }

    /// Returns the reused row and the connection it was taken from.
    fn try_reuse(&self, claim: &PeerClaim, token: &str) -> Option<(Peer, Uuid)> {
        let candidates: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|row| {
                let peer = row.value();
                peer.session_id == claim.session_id
                    && peer.user_id == claim.user_id
                    && peer.state == ConnectionState::Disconnected
                    && peer.client_peer_id.as_deref() == Some(token)
            })
            .map(|row| *row.key())
            .collect();

        for id in candidates {
            let Some(mut peer) = self.peers.get_mut(&id) else {
                continue;
            };
            // another reconnect may have flipped the row since the scan
            if peer.state != ConnectionState::Disconnected {
                continue;
            }
            let replaced = peer.connection_id;
            peer.state = ConnectionState::Connecting;
            peer.connection_id = Uuid::new_v4();
            peer.username = claim.username.clone();
            peer.last_seen_at = Utc::now();
            return Some((peer.clone(), replaced));
        }
        None
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<Session, RegistryError> {
        let session = Self::build_session(new);
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => return Err(RegistryError::SessionExists(session.id)),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        debug!(session_id = %session.id, "registry: session created");
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Session, RegistryError> {
        self.sessions
            .get(&session_id)
            .map(|row| row.clone())
            .ok_or(RegistryError::SessionNotFound(session_id))
    }

    async fn default_session(
        &self,
        resource: &ResourceRef,
        initiator_id: i64,
        kind: SessionKind,
    ) -> Result<Session, RegistryError> {
        // the entry guard serialises concurrent first-use for one resource
        match self.defaults.entry(resource.clone()) {
            Entry::Occupied(mut slot) => {
                if let Some(session) = self.sessions.get(slot.get()) {
                    if !session.is_ended() {
                        return Ok(session.clone());
                    }
                }
                let session = Self::build_session(NewSession {
                    kind,
                    initiator_id,
                    linked_resources: vec![resource.clone()],
                    is_default: true,
                    ..Default::default()
                });
                self.sessions.insert(session.id, session.clone());
                slot.insert(session.id);
                Ok(session)
            }
            Entry::Vacant(slot) => {
                let session = Self::build_session(NewSession {
                    kind,
                    initiator_id,
                    linked_resources: vec![resource.clone()],
                    is_default: true,
                    ..Default::default()
                });
                self.sessions.insert(session.id, session.clone());
                slot.insert(session.id);
                Ok(session)
            }
        }
    }

    async fn activate_session(&self, session_id: Uuid) -> Result<bool, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        if session.status == SessionStatus::Waiting {
            session.status = SessionStatus::Active;
            return Ok(true);
        }
        Ok(false)
    }

    async fn end_session(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Session, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        if !session.is_ended() {
            session.status = SessionStatus::Ended;
            session.ended_at = Some(at);
        }
        Ok(session.clone())
    }

    async fn create_or_reuse_peer(&self, claim: PeerClaim) -> Result<PeerSlot, RegistryError> {
        if !self.sessions.contains_key(&claim.session_id) {
            return Err(RegistryError::SessionNotFound(claim.session_id));
        }

        if let Some(token) = claim.client_peer_id.as_deref() {
            if let Some((peer, replaced)) = self.try_reuse(&claim, token) {
                debug!(peer_id = %peer.id, "registry: reconnect reused peer slot");
                return Ok(PeerSlot {
                    peer,
                    reconnected: true,
                    replaced_connection: Some(replaced),
                });
            }
        }

        let now = Utc::now();
        let token = claim
            .client_peer_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let peer = Peer {
            id: Uuid::new_v4(),
            session_id: claim.session_id,
            user_id: claim.user_id,
            username: claim.username,
            client_peer_id: Some(token),
            connection_id: Uuid::new_v4(),
            role: PeerRole::default(),
            state: ConnectionState::Connecting,
            media: MediaFlags::default(),
            joined_at: now,
            last_seen_at: now,
        };
        self.peers.insert(peer.id, peer.clone());
        Ok(PeerSlot {
            peer,
            reconnected: false,
            replaced_connection: None,
        })
    }

    async fn get_peer(&self, peer_id: Uuid) -> Result<Peer, RegistryError> {
        self.peers
            .get(&peer_id)
            .map(|row| row.clone())
            .ok_or(RegistryError::PeerNotFound(peer_id))
    }

    async fn set_state(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        state: ConnectionState,
    ) -> Result<Peer, RegistryError> {
        self.update_peer(peer_id, connection_id, |peer| {
            if !peer.state.can_transition_to(state) {
                return Err(RegistryError::InvalidTransition {
                    from: peer.state,
                    to: state,
                });
            }
            peer.state = state;
            Ok(())
        })
    }

    async fn set_role(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        role: PeerRole,
    ) -> Result<Peer, RegistryError> {
        self.update_peer(peer_id, connection_id, |peer| {
            peer.role = role;
            Ok(())
        })
    }

    async fn set_media(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        update: MediaUpdate,
    ) -> Result<Peer, RegistryError> {
        self.update_peer(peer_id, connection_id, |peer| {
            update.apply(&mut peer.media);
            Ok(())
        })
    }

    async fn touch(
        &self,
        peer_id: Uuid,
        connection_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.update_peer(peer_id, connection_id, |peer| {
            peer.last_seen_at = at;
            Ok(())
        })
        .map(|_| ())
    }

    async fn list_active_peers(
        &self,
        session_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Peer>, RegistryError> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .filter(|row| {
                let peer = row.value();
                peer.session_id == session_id
                    && peer.state.is_active()
                    && Some(peer.id) != exclude
            })
            .map(|row| row.value().clone())
            .collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        Ok(peers)
    }

    async fn record_signal(&self, new: NewSignal) -> Result<Signal, RegistryError> {
        let signal = Signal {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            from_peer_id: new.from_peer_id,
            to_peer_id: new.to_peer_id,
            signal_type: new.signal_type,
            payload: new.payload,
            delivered: new.delivered,
            created_at: Utc::now(),
        };
        self.signals
            .entry(signal.session_id)
            .or_default()
            .push(signal.clone());
        Ok(signal)
    }

    async fn list_signals(&self, session_id: Uuid) -> Result<Vec<Signal>, RegistryError> {
        Ok(self
            .signals
            .get(&session_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Peer>, RegistryError> {
        let candidates: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|row| row.state.is_active() && row.last_seen_at < cutoff)
            .map(|row| *row.key())
            .collect();

        let mut flipped = Vec::new();
        for id in candidates {
            let Some(mut peer) = self.peers.get_mut(&id) else {
                continue;
            };
            // a heartbeat may have landed since the scan
            if !peer.state.is_active() || peer.last_seen_at >= cutoff {
                continue;
            }
            peer.state = ConnectionState::Disconnected;
            flipped.push(peer.clone());
        }
        Ok(flipped)
    }

    async fn purge_disconnected(&self, cutoff: DateTime<Utc>) -> Result<usize, RegistryError> {
        let mut deleted = 0;
        self.peers.retain(|_, peer| {
            let expired =
                peer.state == ConnectionState::Disconnected && peer.last_seen_at < cutoff;
            if expired {
                deleted += 1;
            }
            !expired
        });
        Ok(deleted)
    }

    async fn purge_ended_sessions(&self, cutoff: DateTime<Utc>) -> Result<usize, RegistryError> {
        let expired = |session: &Session| {
            session.is_ended() && session.ended_at.map(|at| at < cutoff).unwrap_or(false)
        };
        let candidates: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|row| expired(row.value()))
            .map(|row| *row.key())
            .collect();

        let mut deleted = 0;
        for id in candidates {
            if self.sessions.remove_if(&id, |_, session| expired(session)).is_none() {
                continue;
            }
            self.peers.retain(|_, peer| peer.session_id != id);
            self.signals.remove(&id);
            self.defaults.retain(|_, session_id| *session_id != id);
            deleted += 1;
        }
        Ok(deleted)
    }
}
