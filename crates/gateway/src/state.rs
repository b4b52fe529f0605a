//! Application state shared by gateway operations.

use crate::keys::KeyBackend;
use provis_core::config::AppConfig;
use provis_directory::DirectoryCache;
use provis_store::ProvisStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Gateway database.
    pub store: Arc<dyn ProvisStore>,
    /// Cached view of every datacenter's machines.
    pub directory: DirectoryCache,
    /// Key-management backend (optional).
    pub keys: Option<Arc<dyn KeyBackend>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ProvisStore>,
        directory: DirectoryCache,
        keys: Option<Arc<dyn KeyBackend>>,
    ) -> Self {
        if keys.is_none() {
            tracing::warn!("no key backend configured: registered keys are only stored locally");
        }
        Self {
            config: Arc::new(config),
            store,
            directory,
            keys,
        }
    }

    /// Close the database once queued work has drained.
    pub async fn shutdown(&self) -> crate::GatewayResult<()> {
        self.directory.invalidate();
        self.store.close().await?;
        Ok(())
    }
}
