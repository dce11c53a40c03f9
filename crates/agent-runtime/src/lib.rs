//! # agent-runtime
//!
//! Concrete vendor adapters for agent-core, the model catalogue and the
//! process-wide runtime context.
//!
//! ## Adapters
//!
//! - **Anthropic**: Messages API over SSE
//! - **OpenAI-compatible**: OpenAI, Grok, Maritaca, Bedrock's OpenAI endpoint,
//!   and local Ollama / vLLM servers
//! - **Cohere**: Chat v1 over newline-delimited JSON
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{RuntimeConfig, RuntimeContext};
//!
//! let context = RuntimeContext::new(RuntimeConfig::from_env()?, registry);
//! let (orchestrator, advisory) = context.orchestrator(Some("Qwen 3 8b - Ollama"), None)?;
//! let summary = orchestrator.ask(TurnRequest::new("What day is it?")).await?;
//! ```

pub mod anthropic;
pub mod cohere;
pub mod config;
pub mod context;
pub mod factory;
pub mod http;
pub mod openai;
pub mod sse;

pub use anthropic::AnthropicAdapter;
pub use cohere::CohereAdapter;
pub use config::{AnthropicConfig, CohereConfig, OpenAiConfig, RuntimeConfig};
pub use context::RuntimeContext;
pub use factory::{AdapterFactory, Advisory, ModelEntry, ModelStatus};
pub use openai::{OpenAiAdapter, OpenAiPreset};

// Re-export core types for convenience
pub use agent_core::{
    AgentError, ConversationOrchestrator, Result, TurnEvent, TurnRequest, TurnSummary,
};
