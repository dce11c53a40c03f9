//! Application State

use std::sync::Arc;

use agent_runtime::RuntimeContext;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration, model catalogue, tools and sessions
    pub context: Arc<RuntimeContext>,
}

impl AppState {
    pub fn new(context: RuntimeContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}
