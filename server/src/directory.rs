//! Sessions and grants owned by the external record system, loaded into the
//! in-process store and access policy before the gateway accepts sockets.

use std::{fs, path::Path, sync::Arc};

use gateway::access::StaticAccessPolicy;
use registry::{NewSession, RegistryError, ResourceRef, SessionKind, SignalStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::BoxError;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub sessions: Vec<SessionSeed>,
    pub grants: Vec<GrantSeed>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSeed {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: SessionKind,
    pub initiator_id: i64,
    #[serde(default)]
    pub linked_resources: Vec<ResourceRef>,
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
}

/// `user_id` may view `resource`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrantSeed {
    pub user_id: i64,
    pub resource: ResourceRef,
}

impl DirectorySettings {
    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path).map_err(|err| Box::new(err) as BoxError)?;
        let directory = serde_json::from_str(&raw).map_err(|err| Box::new(err) as BoxError)?;
        Ok(directory)
    }

    /// `SERVER_DIRECTORY_PATH` when set, otherwise an empty directory.
    pub fn from_env() -> Result<Self, BoxError> {
        match std::env::var("SERVER_DIRECTORY_PATH") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), BoxError> {
        let mut seen = std::collections::HashSet::new();
        for seed in &self.sessions {
            if !seen.insert(seed.id) {
                let msg = format!("session {} is listed twice in the directory", seed.id);
                return Err(msg.into());
            }
        }
        Ok(())
    }
}

pub struct Directory {
    settings: DirectorySettings,
    store: Arc<dyn SignalStore>,
    access: Arc<StaticAccessPolicy>,
}

impl Directory {
    pub fn new(
        settings: DirectorySettings,
        store: Arc<dyn SignalStore>,
        access: Arc<StaticAccessPolicy>,
    ) -> Self {
        Self {
            settings,
            store,
            access,
        }
    }

    /// Seeds grants, then sessions. A session already present is left as is.
    pub async fn load(&self) -> Result<usize, BoxError> {
        for grant in &self.settings.grants {
            self.access.grant(grant.user_id, grant.resource.clone());
        }

        let mut created = 0;
        for seed in &self.settings.sessions {
            let new = NewSession {
                id: Some(seed.id),
                name: seed.name.clone(),
                kind: seed.kind,
                initiator_id: seed.initiator_id,
                linked_resources: seed.linked_resources.clone(),
                is_default: false,
                configuration: seed.configuration.clone(),
            };
            match self.store.create_session(new).await {
                Ok(_) => created += 1,
                Err(RegistryError::SessionExists(id)) => {
                    warn!(session_id = %id, "directory: session already present")
                }
                Err(err) => return Err(Box::new(err) as BoxError),
            }
        }

        info!(
            sessions = created,
            grants = self.settings.grants.len(),
            "directory loaded"
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::access::AccessPolicy;
    use registry::MemoryStore;

    const RAW: &str = r#"{
        "sessions": [
            {
                "id": "5f0c6f8e-8d57-4c3a-9a43-0d7d2c1c9b10",
                "name": "bench 3 walkthrough",
                "kind": "screen_share",
                "initiator_id": 1,
                "linked_resources": [{"kind": "lab_group", "id": "3"}]
            }
        ],
        "grants": [
            {"user_id": 1, "resource": {"kind": "lab_group", "id": "3"}},
            {"user_id": 2, "resource": {"kind": "lab_group", "id": "3"}}
        ]
    }"#;

    #[tokio::test]
    async fn seeds_sessions_and_grants() {
        let settings: DirectorySettings = serde_json::from_str(RAW).unwrap();
        settings.validate().unwrap();
        let store = Arc::new(MemoryStore::new());
        let access = Arc::new(StaticAccessPolicy::new());
        let directory = Directory::new(settings, store.clone(), access.clone());

        assert_eq!(directory.load().await.unwrap(), 1);

        let id: Uuid = "5f0c6f8e-8d57-4c3a-9a43-0d7d2c1c9b10".parse().unwrap();
        let session = store.get_session(id).await.unwrap();
        assert_eq!(session.kind, SessionKind::ScreenShare);
        assert_eq!(session.name.as_deref(), Some("bench 3 walkthrough"));
        assert!(!session.is_default);

        let group = ResourceRef::new("lab_group", "3");
        assert!(access.can_view(2, &group).await);
        assert!(!access.can_view(3, &group).await);

        // a second load keeps the existing row
        assert_eq!(directory.load().await.unwrap(), 0);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn duplicate_session_ids_are_refused() {
        let mut settings: DirectorySettings = serde_json::from_str(RAW).unwrap();
        let again = settings.sessions[0].clone();
        settings.sessions.push(again);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_document_is_an_empty_directory() {
        let settings: DirectorySettings = serde_json::from_str("{}").unwrap();
        assert!(settings.sessions.is_empty());
        assert!(settings.grants.is_empty());
    }
}
