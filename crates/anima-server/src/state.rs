use std::sync::Arc;

use anima_core::AnimaEngine;

/// Shared application state. The engine owns the process-wide embedding,
/// chat, and index clients.
pub struct AppState {
    pub engine: Arc<AnimaEngine>,
}

impl AppState {
    pub fn new(engine: Arc<AnimaEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }
}
