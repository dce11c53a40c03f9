//! Conversation Orchestrator
//!
//! Owns per-session history. Each user turn assembles the canonical message
//! list, delegates to native generation or the manual tool loop, streams
//! UI-facing events as they arrive and finally reconciles the transcript and
//! persists it.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::generation::{GenerationEvent, UsageRecord, run_generation};
use crate::manual::{ANTI_HALLUCINATION_POSTPEND, ToolInvocationLoop, tool_prompt_section};
use crate::message::{Content, ContentBlock, Conversation, Message, Role};
use crate::provider::{GenerationRequest, VendorAdapter};
use crate::session::{Session, SessionId, SessionStore, SessionTable};
use crate::tool::{ToolDispatcher, ToolInvocationRecord, ToolRegistry};

/// Marker that lets a history entry discard everything before it
pub const CONTEXT_RESET_MARKER: &str = "[|[PAST_FORGOTTEN]|]";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help you answer accurately, and answer directly when they do not.";

/// How tool calls are exchanged with the model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Vendor-native structured tool calls (falls back to manual when unsupported)
    #[default]
    Native,
    /// `<function_calls>` tags parsed out of generated text
    Manual,
}

impl std::str::FromStr for ToolMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "manual" => Ok(Self::Manual),
            other => Err(AgentError::Config(format!(
                "Unknown tool mode '{other}' (expected native or manual)"
            ))),
        }
    }
}

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Base system prompt
    pub system_prompt: String,

    pub tool_mode: ToolMode,

    /// Cap on tool rounds per turn
    pub max_tool_rounds: usize,

    /// Send the anti-hallucination postpend in manual mode
    pub anti_hallucination: bool,

    pub context_reset_marker: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            tool_mode: ToolMode::Native,
            max_tool_rounds: 10,
            anti_hallucination: true,
            context_reset_marker: CONTEXT_RESET_MARKER.into(),
        }
    }
}

/// One user turn
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Existing session; a fresh one is created when absent
    #[serde(default)]
    pub session_id: Option<SessionId>,

    pub message: String,

    /// Base64-encoded JPEG images
    #[serde(default)]
    pub images: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn image(mut self, base64_jpeg: impl Into<String>) -> Self {
        self.images.push(base64_jpeg.into());
        self
    }
}

/// Bookkeeping for a completed turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnSummary {
    pub session_id: SessionId,
    pub answer: String,
    pub tool_invocations: Vec<ToolInvocationRecord>,
    pub usage: Vec<UsageRecord>,
    /// Media paths referenced by the answer (`<path_to_image>` etc.)
    #[serde(default)]
    pub media: Vec<String>,
    /// The model produced no usable answer; `answer` holds the sentinel
    pub failed: bool,
    pub elapsed: Duration,
}

/// UI-facing event of a turn
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Started {
        session_id: SessionId,
    },
    Delta {
        text: String,
    },
    ToolInvoked {
        name: String,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    ToolProgress {
        name: String,
        value: String,
    },
    ToolResult {
        name: String,
        result: String,
    },
    /// Text streamed since the last round boundary is void
    Retry {
        message: String,
        attempt: u32,
        max_retries: u32,
    },
    Finished(TurnSummary),
}

/// Drives user turns against one adapter and tool set
#[derive(Clone)]
pub struct ConversationOrchestrator {
    adapter: Arc<dyn VendorAdapter>,
    registry: ToolRegistry,
    config: OrchestratorConfig,
    store: Option<Arc<dyn SessionStore>>,
    sessions: SessionTable,
    model_key: String,
}

impl ConversationOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn adapter(&self) -> &Arc<dyn VendorAdapter> {
        &self.adapter
    }

    pub const fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub const fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Tool mode actually used with this adapter
    pub fn effective_mode(&self) -> ToolMode {
        if self.config.tool_mode == ToolMode::Native && self.adapter.info().supports_tools {
            ToolMode::Native
        } else {
            ToolMode::Manual
        }
    }

    /// System prompt for the current mode
    pub fn system_prompt(&self) -> String {
        let mut prompt = self.config.system_prompt.clone();
        if self.effective_mode() == ToolMode::Manual && !self.registry.is_empty() {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(&tool_prompt_section(&self.registry));
        }
        prompt
    }

    /// Message list for the next generation: system prompt plus history,
    /// cut at the latest context reset marker.
    ///
    /// The entry holding the marker is replayed as a user message. When it
    /// was an assistant entry, results of the calls it made are dropped with
    /// it and its text is merged into the following user message, so roles
    /// keep alternating.
    pub fn assemble_messages(&self, history: &Conversation) -> Conversation {
        let marker = self.config.context_reset_marker.as_str();
        let turns = history.turns();
        let reset_at = if marker.is_empty() {
            None
        } else {
            turns.iter().rposition(|m| m.text().contains(marker))
        };

        let mut messages = Conversation::new();
        let system = self.system_prompt();
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        match reset_at {
            Some(idx) => {
                debug!(dropped = idx, "Context reset marker found; forgetting earlier history");
                let reset = turns[idx].text();
                let rest = &turns[idx + 1..];
                if turns[idx].role.side() == Role::User {
                    messages.push(Message::user(reset));
                    messages.extend(rest.iter().cloned());
                } else {
                    let rest = &rest[rest.iter().take_while(|m| m.role == Role::Tool).count()..];
                    match rest.split_first() {
                        Some((next, after)) if next.role == Role::User => {
                            messages.push(prefixed(next, &reset));
                            messages.extend(after.iter().cloned());
                        }
                        _ => {
                            messages.push(Message::user(reset));
                            messages.extend(rest.iter().cloned());
                        }
                    }
                }
            }
            None => messages.extend(turns.iter().cloned()),
        }
        messages
    }

    /// Run one user turn.
    ///
    /// The stream always ends with [`TurnEvent::Finished`]. Turns on the same
    /// session are serialized; dropping the stream abandons the turn.
    pub fn chat(&self, request: TurnRequest) -> BoxStream<'static, TurnEvent> {
        let this = self.clone();
        Box::pin(async_stream::stream! {
            let started = Instant::now();
            let session_id = request.session_id.clone().unwrap_or_default();
            yield TurnEvent::Started { session_id: session_id.clone() };

            let handle = this.sessions.handle(&session_id, || this.restore(&session_id));
            let mut session = handle.lock_owned().await;
            if session.metadata.username.is_none() {
                session.metadata.username.clone_from(&request.username);
            }
            session.metadata.model.clone_from(&this.model_key);
            let username = request.username.clone().or_else(|| session.metadata.username.clone());

            session
                .conversation
                .push(Message::user_with_images(request.message.clone(), &request.images));
            let messages = this.assemble_messages(&session.conversation);

            let dispatcher = ToolDispatcher::new(this.registry.clone()).with_username(username);
            let mut events = this.generate(messages, dispatcher.clone());

            let mut outcome = None;
            let mut failure = None;
            let mut usage = Vec::new();
            let mut media_results = Vec::new();
            while let Some(event) = events.next().await {
                match event {
                    GenerationEvent::Delta(text) => yield TurnEvent::Delta { text },
                    GenerationEvent::ToolCall(call) => {
                        yield TurnEvent::ToolInvoked { name: call.name, arguments: call.arguments };
                    }
                    GenerationEvent::ToolProgress { name, value } => {
                        yield TurnEvent::ToolProgress { name, value };
                    }
                    GenerationEvent::ToolResult { name, result, .. } => {
                        if result.contains("<path_to_") {
                            media_results.push(result.clone());
                        }
                        yield TurnEvent::ToolResult { name, result };
                    }
                    GenerationEvent::Retry { message, attempt, max_retries } => {
                        yield TurnEvent::Retry { message, attempt, max_retries };
                    }
                    GenerationEvent::Usage(record) => usage.push(record),
                    GenerationEvent::Failed(sentinel) => failure = Some(sentinel),
                    GenerationEvent::Done(done) => outcome = Some(done),
                }
            }

            let (answer, failed) = match (outcome, failure) {
                (Some(outcome), None) => {
                    let mut answer = outcome.text;
                    if this.effective_mode() == ToolMode::Native {
                        for result in &media_results {
                            let text = format!("\n{result}");
                            answer.push_str(&text);
                            yield TurnEvent::Delta { text };
                        }
                    }
                    session.conversation.extend(outcome.exchange_messages);
                    session.conversation.push(Message::assistant(answer.clone()));
                    (answer, false)
                }
                (_, failure) => {
                    // No answer: drop the unanswered user message so history keeps alternating
                    let mut turns = session.conversation.messages().to_vec();
                    if turns.last().is_some_and(|m| m.role == Role::User) {
                        turns.pop();
                    }
                    session.conversation = Conversation::from_messages(turns);
                    (failure.unwrap_or_else(|| crate::generation::FAILURE_SENTINEL.into()), true)
                }
            };
            session.touch();

            if let Some(store) = &this.store {
                if let Err(e) = store.save(&session) {
                    warn!(session = %session_id, error = %e, "Could not persist chat log");
                }
            }
            drop(session);

            let media = if failed {
                Vec::new()
            } else {
                media_references(&Message::assistant(answer.as_str()))
            };
            let summary = TurnSummary {
                session_id: session_id.clone(),
                media,
                answer,
                tool_invocations: dispatcher.log().take(),
                usage,
                failed,
                elapsed: started.elapsed(),
            };
            info!(
                session = %session_id,
                adapter = %this.adapter.info().name,
                failed,
                tools = summary.tool_invocations.len(),
                elapsed = ?summary.elapsed,
                "Turn finished"
            );
            yield TurnEvent::Finished(summary);
        })
    }

    /// Run a turn to completion and return its summary
    pub async fn ask(&self, request: TurnRequest) -> Result<TurnSummary> {
        let mut events = self.chat(request);
        while let Some(event) = events.next().await {
            if let TurnEvent::Finished(summary) = event {
                return Ok(summary);
            }
        }
        Err(AgentError::Other("turn ended without a summary".into()))
    }

    fn generate(
        &self,
        messages: Conversation,
        dispatcher: ToolDispatcher,
    ) -> BoxStream<'static, GenerationEvent> {
        let adapter = Arc::clone(&self.adapter);
        if self.registry.is_empty() {
            return run_generation(adapter, GenerationRequest::new(messages), None);
        }
        match self.effective_mode() {
            ToolMode::Native => {
                let request = GenerationRequest::new(messages)
                    .tools(self.registry.describe_all())
                    .max_tool_rounds(self.config.max_tool_rounds);
                run_generation(adapter, request, Some(dispatcher))
            }
            ToolMode::Manual => {
                let postpend = self
                    .config
                    .anti_hallucination
                    .then(|| ANTI_HALLUCINATION_POSTPEND.to_string());
                ToolInvocationLoop::new(adapter, dispatcher)
                    .max_rounds(self.config.max_tool_rounds)
                    .run(messages, postpend)
            }
        }
    }

    fn restore(&self, id: &SessionId) -> Session {
        let stored = self.store.as_ref().and_then(|store| {
            store
                .load(id)
                .inspect_err(|e| warn!(session = %id, error = %e, "Could not load chat log"))
                .ok()
                .flatten()
        });
        stored.unwrap_or_else(|| Session::with_id(id.clone()))
    }
}

/// Copy of a user message with `prefix` placed before its content
fn prefixed(message: &Message, prefix: &str) -> Message {
    let content = match &message.content {
        Content::Text(text) => Content::Text(format!("{prefix}\n\n{text}")),
        Content::Blocks(blocks) => {
            let mut merged = vec![ContentBlock::Text { text: format!("{prefix}\n\n") }];
            merged.extend(blocks.iter().cloned());
            Content::Blocks(merged)
        }
    };
    Message {
        content,
        ..message.clone()
    }
}

/// Media references (`<path_to_image>` etc.) found in text blocks of a message
fn media_references(message: &Message) -> Vec<String> {
    let text = match &message.content {
        Content::Text(text) => text.clone(),
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    let mut found = Vec::new();
    for kind in ["image", "audio", "file"] {
        let open = format!("<path_to_{kind}>");
        let close = format!("</path_to_{kind}>");
        for candidate in text.split(open.as_str()).skip(1) {
            if let Some((path, _)) = candidate.split_once(close.as_str()) {
                if !found.iter().any(|p| p == path) {
                    found.push(path.to_string());
                }
            }
        }
    }
    found
}

/// Builder for [`ConversationOrchestrator`]
pub struct OrchestratorBuilder {
    adapter: Option<Arc<dyn VendorAdapter>>,
    registry: ToolRegistry,
    config: OrchestratorConfig,
    store: Option<Arc<dyn SessionStore>>,
    sessions: SessionTable,
    model_key: String,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            adapter: None,
            registry: ToolRegistry::new(),
            config: OrchestratorConfig::default(),
            store: None,
            sessions: SessionTable::new(),
            model_key: String::new(),
        }
    }

    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn VendorAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    #[must_use]
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub const fn tool_mode(mut self, mode: ToolMode) -> Self {
        self.config.tool_mode = mode;
        self
    }

    #[must_use]
    pub const fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.config.max_tool_rounds = rounds;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a session table between orchestrators
    #[must_use]
    pub fn sessions(mut self, sessions: SessionTable) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn model_key(mut self, key: impl Into<String>) -> Self {
        self.model_key = key.into();
        self
    }

    pub fn build(self) -> Result<ConversationOrchestrator> {
        let adapter = self
            .adapter
            .ok_or_else(|| AgentError::Config("Adapter is required".into()))?;
        let model_key = if self.model_key.is_empty() {
            adapter.info().model.clone()
        } else {
            self.model_key
        };

        Ok(ConversationOrchestrator {
            adapter,
            registry: self.registry,
            config: self.config,
            store: self.store,
            sessions: self.sessions,
            model_key,
        })
    }
}
