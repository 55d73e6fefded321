use std::sync::Arc;

use brandkit_db::JobStore;
use brandkit_pipeline::BuildJobManager;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything inside is an `Arc` or wraps one.
#[derive(Clone)]
pub struct AppState {
    /// Build orchestration and the single build slot.
    pub manager: BuildJobManager,
    /// Job record store, shared with the manager.
    pub store: Arc<dyn JobStore>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(manager: BuildJobManager, config: ServerConfig) -> Self {
        Self {
            store: Arc::clone(manager.store()),
            manager,
            config: Arc::new(config),
        }
    }
}
