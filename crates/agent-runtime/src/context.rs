//! Runtime Context
//!
//! Built once at start-up and shared by every request handler.

use agent_core::session::SessionTable;
use agent_core::{
    ConversationOrchestrator, FileSessionStore, OrchestratorConfig, Result, SessionStore,
    ToolRegistry,
};
use std::sync::Arc;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::factory::{AdapterFactory, Advisory};

/// Configuration, adapter factory, tools and session state
#[derive(Clone)]
pub struct RuntimeContext {
    config: RuntimeConfig,
    factory: AdapterFactory,
    registry: ToolRegistry,
    store: Option<Arc<dyn SessionStore>>,
    sessions: SessionTable,
    system_prompt: Option<String>,
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig, registry: ToolRegistry) -> Self {
        let store = config.chat_log_dir.as_ref().map(|dir| {
            info!(dir = %dir.display(), "Persisting chat logs");
            Arc::new(FileSessionStore::new(dir.clone())) as Arc<dyn SessionStore>
        });
        Self {
            factory: AdapterFactory::new(config.clone()),
            config,
            registry,
            store,
            sessions: SessionTable::new(),
            system_prompt: None,
        }
    }

    /// Replace the session store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub const fn factory(&self) -> &AdapterFactory {
        &self.factory
    }

    pub const fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn SessionStore>> {
        self.store.as_ref()
    }

    /// Orchestrator for `model_key` (the configured default when `None`),
    /// restricted to `tool_subset` when given
    pub fn orchestrator(
        &self,
        model_key: Option<&str>,
        tool_subset: Option<&[String]>,
    ) -> Result<(ConversationOrchestrator, Option<Advisory>)> {
        let key = model_key.unwrap_or(&self.config.default_model);
        let (adapter, advisory) = self.factory.create(key)?;
        let registry = match tool_subset {
            Some(names) => self.registry.subset(names),
            None => self.registry.clone(),
        };

        let mut config = OrchestratorConfig {
            tool_mode: self.config.tool_mode,
            max_tool_rounds: self.config.max_tool_rounds,
            ..OrchestratorConfig::default()
        };
        if let Some(prompt) = &self.system_prompt {
            config.system_prompt.clone_from(prompt);
        }

        let mut builder = ConversationOrchestrator::builder()
            .adapter(adapter)
            .tools(registry)
            .config(config)
            .sessions(self.sessions.clone())
            .model_key(key);
        if let Some(store) = &self.store {
            builder = builder.store(Arc::clone(store));
        }
        Ok((builder.build()?, advisory))
    }
}
