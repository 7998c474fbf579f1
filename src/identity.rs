//! Instance identifier persisted in the workspace

use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

pub const IDENTITY_FILE: &str = "uuid";

/// Identifies one client installation across remounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub id: Uuid,

    /// When the identifier was first generated
    pub created_at: DateTime<Utc>,

    /// Not written to disk
    #[serde(skip)]
    pub ephemeral: bool,
}

impl InstanceIdentity {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            ephemeral: false,
        }
    }

    pub fn file_path(workspace: &Path) -> PathBuf {
        workspace.join(IDENTITY_FILE)
    }

    /// Load the identifier from the workspace
    pub async fn load(workspace: &Path) -> StrataResult<Option<Self>> {
        let path = Self::file_path(workspace);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StrataError::io(format!("reading identity file {}", path.display()), e))?;
        let identity: InstanceIdentity = serde_json::from_str(&content)?;
        Ok(Some(identity))
    }

    /// Save identifier to the workspace
    pub async fn save(&self, workspace: &Path) -> StrataResult<()> {
        let path = Self::file_path(workspace);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .await
            .map_err(|e| StrataError::io(format!("writing identity file {}", path.display()), e))?;
        Ok(())
    }

    /// Load or create; any failure yields an ephemeral identifier
    pub async fn load_or_create(workspace: &Path) -> Self {
        match Self::load(workspace).await {
            Ok(Some(identity)) => return identity,
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable instance identifier: {}", e),
        }

        let mut identity = Self::generate();
        match identity.save(workspace).await {
            Ok(()) => debug!("Generated instance identifier {}", identity.id),
            Err(e) => {
                warn!("Using ephemeral instance identifier: {}", e);
                identity.ephemeral = true;
            }
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn created_once_then_reused() {
        let temp = TempDir::new().unwrap();
        let first = InstanceIdentity::load_or_create(temp.path()).await;
        assert!(!first.ephemeral);
        assert!(temp.path().join(IDENTITY_FILE).exists());

        let second = InstanceIdentity::load_or_create(temp.path()).await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn garbage_file_is_replaced() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(IDENTITY_FILE), "not json").unwrap();
        assert!(InstanceIdentity::load(temp.path()).await.is_err());

        let identity = InstanceIdentity::load_or_create(temp.path()).await;
        assert!(!identity.ephemeral);
        let reloaded = InstanceIdentity::load(temp.path()).await.unwrap().unwrap();
        assert_eq!(reloaded.id, identity.id);
    }

    #[tokio::test]
    async fn unwritable_workspace_gives_ephemeral_id() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone");
        let identity = InstanceIdentity::load_or_create(&missing).await;
        assert!(identity.ephemeral);
    }
}
