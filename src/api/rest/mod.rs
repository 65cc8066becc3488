pub mod error;
pub mod handlers;
pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::EngineHandle;

/// Shared application state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub handle: Arc<EngineHandle>,
    /// Source of the `config/reload` hook; absent in embedded setups.
    pub config_path: Option<Arc<PathBuf>>,
}
