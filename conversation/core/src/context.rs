//! Runtime Context
//!
//! Process-wide collaborators shared by every conversation: the resolved
//! configuration and the secret registry. Built once and passed to
//! [`Conversation::new`](crate::Conversation::new) by reference.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, ConfigError, ConfigOverrides, ConversationConfig};
use crate::file_store::{FileStore, FileStoreError, LocalFileStore};
use crate::secrets::SecretRegistry;
use crate::state::ConversationId;

/// Shared configuration and secrets
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    config: ConversationConfig,
    secrets: Arc<SecretRegistry>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

impl RuntimeContext {
    /// Context over an already resolved configuration
    #[must_use]
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            secrets: Arc::new(SecretRegistry::new()),
        }
    }

    /// Load the configuration file and environment, then apply `overrides`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or is invalid.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = config::load_config()?;
        overrides.apply(&mut config)?;
        tracing::debug!(source = %config.source(), "Runtime context configured");
        Ok(Self::new(config))
    }

    /// Resolved configuration
    #[must_use]
    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Shared secret registry
    #[must_use]
    pub fn secrets(&self) -> Arc<SecretRegistry> {
        Arc::clone(&self.secrets)
    }

    /// On-disk store for conversation `id`, when persistence is enabled
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation directory cannot be created.
    pub fn store_for(
        &self,
        id: ConversationId,
    ) -> Result<Option<(Arc<dyn FileStore>, PathBuf)>, FileStoreError> {
        let Some(root) = self.config.persistence.resolved_root() else {
            return Ok(None);
        };
        let dir = root.join(id.to_string());
        let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&dir)?);
        Ok(Some((store, dir)))
    }
}
