//! Per-connection signaling protocol.
//!
//! A [`SignalRelay`] owns exactly one (session, peer) pair for the lifetime
//! of one socket. Replies to the caller and fabric deliveries share the same
//! outbox, so the caller sees them in the order they were produced.

use std::sync::Arc;

use chrono::Utc;
use common_net::{
    fabric::{peer_group, session_group, Fabric, FabricError, Outbox},
    message::{
        ClientMessage, ConnectionState, PeerRole, PeerStateUpdate, PeerSummary, ProtocolError,
        ServerMessage,
    },
    metrics::relay_metrics,
};
use registry::{
    MediaUpdate, NewSignal, Peer, PeerClaim, RegistryError, ResourceRef, SessionKind,
    SignalStore, SignalType,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{access::AccessPolicy, auth::Identity, ice::IceIssuer};

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct RelayDeps {
    pub store: Arc<dyn SignalStore>,
    pub fabric: Arc<dyn Fabric>,
    pub access: Arc<dyn AccessPolicy>,
    pub ice: Arc<IceIssuer>,
}

/// The session a connection asks to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Id(Uuid),
    /// The live default session of a record, created on first connect.
    Default { resource: ResourceRef, kind: SessionKind },
}

impl From<Uuid> for SessionTarget {
    fn from(session_id: Uuid) -> Self {
        SessionTarget::Id(session_id)
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionTarget::Id(id) => write!(f, "{id}"),
            SessionTarget::Default { resource, .. } => {
                write!(f, "default:{}/{}", resource.kind, resource.id)
            }
        }
    }
}

/// Why a connection was closed during establishment.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectError {
    pub fn close_code(&self) -> u16 {
        match self {
            ConnectError::Unauthenticated => 4001,
            ConnectError::NotFound => 4004,
            ConnectError::Forbidden => 4003,
            ConnectError::Internal(_) => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ConnectError::Unauthenticated => "unauthenticated",
            ConnectError::NotFound => "not found",
            ConnectError::Forbidden => "forbidden",
            ConnectError::Internal(_) => "internal error",
        }
    }
}

impl From<RegistryError> for ConnectError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionNotFound(_) => ConnectError::NotFound,
            other => ConnectError::Internal(other.to_string()),
        }
    }
}

impl From<FabricError> for ConnectError {
    fn from(err: FabricError) -> Self {
        ConnectError::Internal(err.to_string())
    }
}

/// Failure while handling one inbound message. The connection stays open.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Client(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

impl RelayError {
    /// Text sent back in the `error` message.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Protocol(err) => err.to_string(),
            RelayError::Client(msg) => msg.clone(),
            RelayError::Registry(
                err @ (RegistryError::InvalidTransition { .. } | RegistryError::Superseded(_)),
            ) => err.to_string(),
            RelayError::Registry(_) | RelayError::Fabric(_) => "internal error".to_string(),
        }
    }

    fn is_internal(&self) -> bool {
        matches!(
            self,
            RelayError::Fabric(_)
                | RelayError::Registry(RegistryError::Unavailable(_))
                | RelayError::Registry(RegistryError::PeerNotFound(_))
                | RelayError::Registry(RegistryError::SessionNotFound(_))
        )
    }
}

pub struct SignalRelay {
    deps: RelayDeps,
    session_id: Uuid,
    peer_id: Uuid,
    connection_id: Uuid,
    user_id: i64,
    username: String,
    outbox: Outbox,
}

impl std::fmt::Debug for SignalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRelay")
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl SignalRelay {
    /// Runs the establishment sequence. On success the caller's outbox has
    /// already received `connection.established`.
    pub async fn connect(
        deps: RelayDeps,
        identity: Option<Identity>,
        target: impl Into<SessionTarget>,
        client_peer_id: Option<String>,
        outbox: Outbox,
    ) -> Result<Self, ConnectError> {
        let target = target.into();
        let result =
            Self::establish(deps, identity, target.clone(), client_peer_id, outbox).await;
        match &result {
            Ok(relay) => {
                relay_metrics().on_connect();
                info!(
                    session_id = %relay.session_id,
                    peer_id = %relay.peer_id,
                    user_id = relay.user_id,
                    "signaling connection established"
                );
            }
            Err(err) => {
                relay_metrics().on_rejected(err.reason());
                match err {
                    ConnectError::Internal(detail) => {
                        error!(%target, %detail, "signaling connect failed")
                    }
                    _ => warn!(%target, reason = err.reason(), "signaling connect rejected"),
                }
            }
        }
        result
    }

    async fn establish(
        deps: RelayDeps,
        identity: Option<Identity>,
        target: SessionTarget,
        client_peer_id: Option<String>,
        outbox: Outbox,
    ) -> Result<Self, ConnectError> {
        let identity = identity.ok_or(ConnectError::Unauthenticated)?;

        let session = match target {
            SessionTarget::Id(session_id) => deps.store.get_session(session_id).await?,
            SessionTarget::Default { resource, kind } => {
                if !deps.access.can_view(identity.user_id, &resource).await {
                    return Err(ConnectError::Forbidden);
                }
                deps.store
                    .default_session(&resource, identity.user_id, kind)
                    .await?
            }
        };
        let session_id = session.id;
        if session.is_ended() {
            return Err(ConnectError::NotFound);
        }
        if !crate::access::authorize(deps.access.as_ref(), &session, identity.user_id).await {
            return Err(ConnectError::Forbidden);
        }

        let slot = deps
            .store
            .create_or_reuse_peer(PeerClaim {
                session_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
                client_peer_id: client_peer_id.filter(|token| !token.is_empty()),
            })
            .await?;
        let peer = slot.peer;

        // a reconnect may take the slot from a socket that is still open
        if let Some(replaced) = slot.replaced_connection {
            for group in [session_group(session_id), peer_group(peer.id)] {
                if let Err(err) = deps.fabric.leave(&group, replaced).await {
                    warn!(group, %err, "could not evict replaced connection");
                }
            }
        }

        let relay = SignalRelay {
            deps,
            session_id,
            peer_id: peer.id,
            connection_id: peer.connection_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            outbox,
        };

        // established goes out before any group traffic can reach the outbox
        let ice_servers = relay
            .deps
            .ice
            .ice_servers(&identity.username, relay.deps.ice.settings().include_stun);
        relay.reply(ServerMessage::Established {
            peer_id: peer.id,
            client_peer_id: peer.client_peer_id.clone().unwrap_or_default(),
            session_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            ice_servers,
            is_reconnection: slot.reconnected,
        });

        if let Err(err) = relay.subscribe().await {
            relay.release_slot().await;
            return Err(err.into());
        }

        if let Err(err) = relay.deps.store.activate_session(session_id).await {
            warn!(%session_id, %err, "could not activate session");
        }

        if !slot.reconnected {
            let joined = ServerMessage::PeerJoined {
                peer_id: peer.id,
                user_id: identity.user_id,
                username: identity.username,
            };
            if let Err(err) = relay
                .deps
                .fabric
                .publish(&session_group(session_id), joined, Some(relay.connection_id))
                .await
            {
                error!(%err, "could not announce peer.joined");
            }
        }

        Ok(relay)
    }

    async fn subscribe(&self) -> Result<(), FabricError> {
        self.deps
            .fabric
            .join(
                &session_group(self.session_id),
                self.connection_id,
                self.outbox.clone(),
            )
            .await?;
        self.deps
            .fabric
            .join(
                &peer_group(self.peer_id),
                self.connection_id,
                self.outbox.clone(),
            )
            .await
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn reply(&self, message: ServerMessage) {
        // the receiver only goes away with the socket
        let _ = self.outbox.send(message);
    }

    /// Handles one inbound text frame. Failures become an `error` reply.
    pub async fn handle_text(&self, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(message) => {
                relay_metrics().on_message(message.kind().as_str());
                self.dispatch(message).await
            }
            Err(err) => {
                relay_metrics().on_message("invalid");
                Err(err.into())
            }
        };

        if let Err(err) = result {
            if err.is_internal() {
                error!(peer_id = %self.peer_id, %err, "signaling message failed");
            } else {
                warn!(peer_id = %self.peer_id, %err, "signaling client error");
            }
            self.reply(ServerMessage::error(err.client_message()));
        }
    }

    pub fn reject_frame(&self, reason: &str) {
        relay_metrics().on_message("invalid");
        self.reply(ServerMessage::error(reason));
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<(), RelayError> {
        match message {
            ClientMessage::Check { peer_role } => self.handle_check(peer_role).await,
            ClientMessage::Offer { to_peer_id, sdp } => {
                let forward = ServerMessage::Offer {
                    from_peer_id: self.peer_id,
                    from_user_id: self.user_id,
                    from_username: self.username.clone(),
                    sdp: sdp.clone(),
                };
                self.relay_to(to_peer_id, SignalType::Offer, json!({ "sdp": sdp }), forward)
                    .await
            }
            ClientMessage::Answer { to_peer_id, sdp } => {
                let forward = ServerMessage::Answer {
                    from_peer_id: self.peer_id,
                    from_user_id: self.user_id,
                    from_username: self.username.clone(),
                    sdp: sdp.clone(),
                };
                self.relay_to(to_peer_id, SignalType::Answer, json!({ "sdp": sdp }), forward)
                    .await
            }
            ClientMessage::IceCandidate {
                to_peer_id,
                candidate,
            } => {
                let forward = ServerMessage::IceCandidate {
                    from_peer_id: self.peer_id,
                    from_user_id: self.user_id,
                    from_username: self.username.clone(),
                    candidate: candidate.clone(),
                };
                self.relay_to(
                    to_peer_id,
                    SignalType::IceCandidate,
                    json!({ "candidate": candidate }),
                    forward,
                )
                .await
            }
            ClientMessage::PeerState(update) => self.handle_peer_state(update).await,
            ClientMessage::Heartbeat => {
                let now = Utc::now();
                self.deps
                    .store
                    .touch(self.peer_id, self.connection_id, now)
                    .await?;
                self.reply(ServerMessage::HeartbeatResponse { timestamp: now });
                Ok(())
            }
        }
    }

    async fn handle_check(&self, peer_role: PeerRole) -> Result<(), RelayError> {
        self.deps
            .store
            .set_role(self.peer_id, self.connection_id, peer_role)
            .await?;
        let others = self
            .deps
            .store
            .list_active_peers(self.session_id, Some(self.peer_id))
            .await?;

        let mut reached = 0;
        for other in &others {
            let notice = ServerMessage::PeerCheck {
                from_peer_id: self.peer_id,
                from_user_id: self.user_id,
                from_username: self.username.clone(),
                peer_role,
            };
            reached += self.publish_best_effort(&peer_group(other.id), notice).await;
        }

        self.deps
            .store
            .record_signal(NewSignal {
                session_id: self.session_id,
                from_peer_id: self.peer_id,
                to_peer_id: None,
                signal_type: SignalType::Check,
                payload: json!({ "peer_role": peer_role }),
                delivered: reached > 0,
            })
            .await?;

        debug!(peer_id = %self.peer_id, peers = others.len(), "check answered");
        self.reply(ServerMessage::CheckResponse {
            peers: others.iter().map(PeerSummary::from).collect(),
        });
        Ok(())
    }

    async fn relay_to(
        &self,
        to_peer_id: Uuid,
        signal_type: SignalType,
        payload: Value,
        forward: ServerMessage,
    ) -> Result<(), RelayError> {
        self.owned_row().await?;
        match self.deps.store.get_peer(to_peer_id).await {
            Ok(target) if target.session_id != self.session_id => {
                return Err(RelayError::Client(format!(
                    "Peer {to_peer_id} is not part of this session"
                )));
            }
            Ok(_) | Err(RegistryError::PeerNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let reached = self
            .publish_best_effort(&peer_group(to_peer_id), forward)
            .await;
        self.deps
            .store
            .record_signal(NewSignal {
                session_id: self.session_id,
                from_peer_id: self.peer_id,
                to_peer_id: Some(to_peer_id),
                signal_type,
                payload,
                delivered: reached > 0,
            })
            .await?;

        relay_metrics().on_signal(signal_type.as_str());
        debug!(
            from = %self.peer_id,
            to = %to_peer_id,
            kind = signal_type.as_str(),
            delivered = reached > 0,
            "signal relayed"
        );
        Ok(())
    }

    async fn handle_peer_state(&self, update: PeerStateUpdate) -> Result<(), RelayError> {
        let mut peer: Option<Peer> = None;
        if let Some(state) = update.connection_state {
            peer = Some(
                self.deps
                    .store
                    .set_state(self.peer_id, self.connection_id, state)
                    .await?,
            );
        }
        let media = MediaUpdate {
            has_video: update.has_video,
            has_audio: update.has_audio,
            has_screen_share: update.has_screen_share,
        };
        if !media.is_empty() {
            peer = Some(
                self.deps
                    .store
                    .set_media(self.peer_id, self.connection_id, media)
                    .await?,
            );
        }
        let peer = match peer {
            Some(peer) => peer,
            None => self.owned_row().await?,
        };

        self.deps
            .fabric
            .publish(
                &session_group(self.session_id),
                ServerMessage::PeerStateUpdate {
                    peer_id: peer.id,
                    user_id: peer.user_id,
                    username: peer.username.clone(),
                    connection_state: peer.state,
                    has_video: peer.media.has_video,
                    has_audio: peer.media.has_audio,
                    has_screen_share: peer.media.has_screen_share,
                },
                Some(self.connection_id),
            )
            .await?;
        Ok(())
    }

    /// The peer row, as long as this connection still holds it.
    async fn owned_row(&self) -> Result<Peer, RelayError> {
        let peer = self.deps.store.get_peer(self.peer_id).await?;
        if peer.connection_id != self.connection_id {
            return Err(RegistryError::Superseded(self.peer_id).into());
        }
        Ok(peer)
    }

    async fn publish_best_effort(&self, group: &str, message: ServerMessage) -> usize {
        match self.deps.fabric.publish(group, message, None).await {
            Ok(reached) => reached,
            Err(err) => {
                error!(group, %err, "fabric publish failed");
                0
            }
        }
    }

    /// Tears the connection down. The peer row is kept for reconnection.
    pub async fn disconnect(self) {
        relay_metrics().on_disconnect();

        let owner = match self.deps.store.get_peer(self.peer_id).await {
            Ok(peer) => peer.connection_id == self.connection_id,
            Err(RegistryError::PeerNotFound(_)) => false,
            Err(err) => {
                error!(peer_id = %self.peer_id, %err, "peer lookup failed on disconnect");
                true
            }
        };

        if owner {
            let left = ServerMessage::PeerLeft {
                peer_id: self.peer_id,
                user_id: self.user_id,
                username: self.username.clone(),
            };
            if let Err(err) = self
                .deps
                .fabric
                .publish(&session_group(self.session_id), left, Some(self.connection_id))
                .await
            {
                error!(%err, "could not announce peer.left");
            }
        }

        self.unsubscribe().await;

        if owner {
            self.release_slot().await;
        } else {
            debug!(peer_id = %self.peer_id, "peer slot already taken over");
        }
        info!(session_id = %self.session_id, peer_id = %self.peer_id, "signaling connection closed");
    }

    async fn unsubscribe(&self) {
        for group in [session_group(self.session_id), peer_group(self.peer_id)] {
            if let Err(err) = self.deps.fabric.leave(&group, self.connection_id).await {
                error!(group, %err, "fabric leave failed");
            }
        }
    }

    async fn release_slot(&self) {
        match self
            .deps
            .store
            .set_state(self.peer_id, self.connection_id, ConnectionState::Disconnected)
            .await
        {
            Ok(_) => {}
            Err(RegistryError::PeerNotFound(_) | RegistryError::Superseded(_)) => return,
            Err(err) => error!(peer_id = %self.peer_id, %err, "could not mark peer disconnected"),
        }
        if let Err(err) = self
            .deps
            .store
            .touch(self.peer_id, self.connection_id, Utc::now())
            .await
        {
            debug!(peer_id = %self.peer_id, %err, "touch on disconnect failed");
        }
    }
}
