//! Quota managed by an external cache plugin
//!
//! The plugin owns its storage and does its own accounting; this policy only
//! forwards the size, capacity and cleanup questions.

use super::QuotaPolicy;
use crate::cache::plugin::PluginConnection;
use crate::cache::ContentKey;
use crate::error::StrataResult;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug)]
pub struct DelegatedQuota {
    plugin: Arc<PluginConnection>,
}

impl DelegatedQuota {
    pub fn new(plugin: Arc<PluginConnection>) -> Self {
        Self { plugin }
    }
}

#[async_trait]
impl QuotaPolicy for DelegatedQuota {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn capacity(&self) -> StrataResult<u64> {
        Ok(self.plugin.info().await?.1)
    }

    async fn size(&self) -> StrataResult<u64> {
        Ok(self.plugin.info().await?.0)
    }

    // The plugin tracks its own objects.
    async fn insert(&self, _key: &ContentKey, _size: u64) -> StrataResult<()> {
        Ok(())
    }

    async fn touch(&self, _key: &ContentKey) -> StrataResult<()> {
        Ok(())
    }

    async fn remove(&self, _key: &ContentKey) -> StrataResult<()> {
        Ok(())
    }

    async fn cleanup(&self, leave_size: u64) -> StrataResult<bool> {
        self.plugin.cleanup(leave_size).await
    }
}
