use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{ProgressTracker, Scheduler};
use crate::error::StorageError;
use crate::remote::Connector;
use crate::session::{ClientHandle, SessionManager};
use crate::storage::StorageManager;

/// Process-wide state shared by every command.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub storage: Arc<StorageManager>,
    pub progress: ProgressTracker,
}

impl AppContext {
    /// Opens the stores named by `config`.
    pub async fn new(config: AppConfig) -> Result<Self, StorageError> {
        let storage = StorageManager::from_location(&config.storage_location()).await?;
        Ok(Self::with_storage(config, storage))
    }

    pub fn with_storage(config: AppConfig, storage: StorageManager) -> Self {
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            progress: ProgressTracker::new(),
        }
    }

    /// Session manager for `namespace`, or the configured default account.
    pub async fn sessions(
        &self,
        connector: Arc<dyn Connector>,
        namespace: Option<&str>,
        takeout: bool,
    ) -> Result<SessionManager, StorageError> {
        let name = namespace.unwrap_or(&self.config.namespace);
        let ns = self.storage.open(name).await?;
        Ok(SessionManager::new(
            connector,
            ns,
            self.config.session_options(takeout),
        ))
    }

    /// Scheduler bound to an open session, reporting into the shared tracker.
    pub fn scheduler(&self, client: &ClientHandle) -> Scheduler {
        Scheduler::new(
            Arc::clone(&client.service),
            client.throttle.clone(),
            Arc::clone(&client.namespace),
            self.config.retry_policy(),
        )
        .with_progress(self.progress.clone())
    }
}
