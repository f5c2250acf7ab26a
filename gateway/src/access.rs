//! Capability check against the external record system.

use async_trait::async_trait;
use dashmap::DashSet;
use registry::{ResourceRef, Session};

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn can_view(&self, user_id: i64, resource: &ResourceRef) -> bool;
}

/// A session without linked records belongs to its initiator alone;
/// otherwise one viewable record is enough.
pub async fn authorize(policy: &dyn AccessPolicy, session: &Session, user_id: i64) -> bool {
    if session.linked_resources.is_empty() {
        return session.initiator_id == user_id;
    }
    for resource in &session.linked_resources {
        if policy.can_view(user_id, resource).await {
            return true;
        }
    }
    false
}

/// In-process grant table, fed by whatever owns membership.
#[derive(Debug, Default)]
pub struct StaticAccessPolicy {
    grants: DashSet<(i64, ResourceRef)>,
}

impl StaticAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: i64, resource: ResourceRef) {
        self.grants.insert((user_id, resource));
    }

    pub fn revoke(&self, user_id: i64, resource: &ResourceRef) {
        self.grants.remove(&(user_id, resource.clone()));
    }
}

#[async_trait]
impl AccessPolicy for StaticAccessPolicy {
    async fn can_view(&self, user_id: i64, resource: &ResourceRef) -> bool {
        self.grants.contains(&(user_id, resource.clone()))
    }
}
