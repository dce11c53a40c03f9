//! # agent-core
//!
//! Vendor-neutral tool-use orchestration: the tool registry and dispatcher,
//! the generation state machine, the manual `<function_calls>` protocol and
//! the conversation orchestrator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 ConversationOrchestrator                     │
//! │  ┌──────────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │ run_generation / │  │    Tool     │  │  VendorAdapter  │  │
//! │  │ ToolInvocation-  │──│ Dispatcher  │──│   (Strategy)    │  │
//! │  │      Loop        │  │             │  │                 │  │
//! │  └──────────────────┘  └─────────────┘  └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `VendorAdapter` trait lets Anthropic, OpenAI-compatible servers or
//! Cohere be swapped without changing the loop.

pub mod error;
pub mod generation;
pub mod manual;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod session;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{AgentError, Result};
pub use generation::{FAILURE_SENTINEL, GenerationEvent, GenerationOutcome, UsageRecord, run_generation};
pub use manual::ToolInvocationLoop;
pub use message::{Content, ContentBlock, Conversation, Message, Role};
pub use orchestrator::{
    ConversationOrchestrator, OrchestratorConfig, ToolMode, TurnEvent, TurnRequest, TurnSummary,
};
pub use provider::{AdapterInfo, GenerationRequest, Pricing, RetryPolicy, VendorAdapter};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionId, SessionStore};
pub use tool::{
    ParamType, ParamValue, ParameterSchema, Tool, ToolArgs, ToolDescriptor, ToolDispatcher,
    ToolOutput, ToolRegistry,
};
