//! Group pub/sub used to fan signaling events out to live connections.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::message::ServerMessage;

/// Identifies one subscribed connection (the peer's connection id).
pub type SubscriberId = Uuid;

/// Delivery end of a connection; the socket task drains the receiver.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

pub fn session_group(session_id: Uuid) -> String {
    format!("webrtc_session_{session_id}")
}

pub fn peer_group(peer_id: Uuid) -> String {
    format!("webrtc_peer_{peer_id}")
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("fabric unavailable: {0}")]
    Unavailable(String),
}

/// Messages published by one caller to one subscriber arrive in publish
/// order. Nothing is promised across groups.
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn join(
        &self,
        group: &str,
        subscriber: SubscriberId,
        outbox: Outbox,
    ) -> Result<(), FabricError>;

    async fn leave(&self, group: &str, subscriber: SubscriberId) -> Result<(), FabricError>;

    /// Delivers to every current member except `exclude`. Returns how many
    /// subscribers were reached.
    async fn publish(
        &self,
        group: &str,
        message: ServerMessage,
        exclude: Option<SubscriberId>,
    ) -> Result<usize, FabricError>;
}

/// In-process fabric: one outbox per connection, groups kept in memory.
#[derive(Debug, Default)]
pub struct LocalFabric {
    groups: RwLock<HashMap<String, HashMap<SubscriberId, Outbox>>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn group_size(&self, group: &str) -> usize {
        self.groups
            .read()
            .await
            .get(group)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    async fn join(
        &self,
        group: &str,
        subscriber: SubscriberId,
        outbox: Outbox,
    ) -> Result<(), FabricError> {
        let mut groups = self.groups.write().await;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(subscriber, outbox);
        Ok(())
    }

    async fn leave(&self, group: &str, subscriber: SubscriberId) -> Result<(), FabricError> {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(&subscriber);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        group: &str,
        message: ServerMessage,
        exclude: Option<SubscriberId>,
    ) -> Result<usize, FabricError> {
        let mut reached = 0;
        let mut closed = Vec::new();
        {
            let groups = self.groups.read().await;
            let Some(members) = groups.get(group) else {
                return Ok(0);
            };
            for (id, outbox) in members {
                if Some(*id) == exclude {
                    continue;
                }
                if outbox.send(message.clone()).is_ok() {
                    reached += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            debug!(group, pruned = closed.len(), "fabric: pruning closed outboxes");
            let mut groups = self.groups.write().await;
            if let Some(members) = groups.get_mut(group) {
                for id in closed {
                    members.remove(&id);
                }
                if members.is_empty() {
                    groups.remove(group);
                }
            }
        }

        Ok(reached)
    }
}
