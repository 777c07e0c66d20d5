use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::notifications::Notifier;
use crate::core::{JobStore, RunSupervisor, SyncEngine};

/// Everything a scheduler tick or a manual run needs, passed explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn JobStore>,
    pub supervisor: RunSupervisor,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let supervisor = RunSupervisor::new(SyncEngine::new(config.sync_files));
        Self {
            config: Arc::new(config),
            store,
            supervisor,
            notifier,
        }
    }
}
