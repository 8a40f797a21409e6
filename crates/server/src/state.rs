use std::path::PathBuf;
use std::sync::Arc;

use recast_transcoder::TaskRegistry;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Directory served; every request path resolves below it.
    pub root: Arc<PathBuf>,
    pub registry: TaskRegistry,
}

impl AppState {
    pub fn new(root: impl Into<PathBuf>, registry: TaskRegistry) -> Self {
        Self {
            root: Arc::new(root.into()),
            registry,
        }
    }
}
