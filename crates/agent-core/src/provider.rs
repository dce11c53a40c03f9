//! Vendor Adapter Strategy Pattern
//!
//! Defines a common interface for all LLM vendors (Anthropic, OpenAI-compatible
//! servers, Cohere, ...) so the generation loop works with any backend.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::generation::run_generation;
//!
//! let adapter: Arc<dyn VendorAdapter> = Arc::new(AnthropicAdapter::new(config));
//! let mut events = run_generation(adapter, request, Some(dispatcher));
//! while let Some(event) = events.next().await { /* ... */ }
//! ```
//!
//! An adapter only translates: canonical messages into a request body, the
//! vendor's streamed frames into [`VendorEvent`]s, and completed tool rounds
//! back into the request body. Retries, tool dispatch and bookkeeping live in
//! [`crate::generation`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::message::Conversation;
use crate::tool::ToolDescriptor;

/// Price per million tokens, used for the naive cost estimate
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Weighted sum of word counts, treating a word as a token
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, request_words: usize, answer_words: usize) -> f64 {
        (request_words as f64).mul_add(
            self.input_per_million,
            answer_words as f64 * self.output_per_million,
        ) / 1_000_000.0
    }
}

/// Backoff schedule for transport failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "secs")]
    pub base_delay: Duration,

    /// Growth factor applied after each retry
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: 1.2,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(6))
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Static facts about a configured adapter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Vendor label used in logs (e.g., "Anthropic", "Ollama")
    pub name: String,

    /// Model identifier sent on the wire
    pub model: String,

    /// Whether the vendor supports structured tool calling
    pub supports_tools: bool,

    /// Whether user/assistant roles must strictly alternate
    pub strict_alternation: bool,

    /// Whether a postpend can be placed in the assistant's mouth
    pub supports_prefill: bool,

    pub pricing: Pricing,

    pub retry: RetryPolicy,
}

/// Everything needed to build one generation request
#[derive(Clone, Debug, Default)]
pub struct GenerationRequest {
    /// Canonical history, ending on a user message
    pub messages: Conversation,

    /// Text placed in the model's mouth before it continues
    pub postpend: Option<String>,

    /// Caller-supplied stop sequences
    pub stop_sequences: Vec<String>,

    /// Tools offered for native calling (empty in manual mode)
    pub tools: Vec<ToolDescriptor>,

    /// Cap on native tool rounds for one generation
    pub max_tool_rounds: usize,
}

impl GenerationRequest {
    pub fn new(messages: Conversation) -> Self {
        Self {
            messages,
            max_tool_rounds: 10,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn postpend(mut self, postpend: impl Into<String>) -> Self {
        let postpend = postpend.into();
        self.postpend = (!postpend.is_empty()).then_some(postpend);
        self
    }

    #[must_use]
    pub fn stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub const fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }
}

/// A tool call requested by the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Vendor correlation id (minted locally when the vendor has none)
    pub id: String,

    pub name: String,

    pub arguments: Map<String, Value>,
}

/// Canonical event decoded from a vendor stream
#[derive(Clone, Debug, PartialEq)]
pub enum VendorEvent {
    /// Visible text
    TextDelta(String),
    /// A tool-call block opened
    ToolCallStart { id: String, name: String },
    /// Partial JSON of the open tool call's arguments
    ToolCallArgsDelta(String),
    /// The open tool-call block closed
    ToolCallEnd,
    /// A tool call delivered whole (vendors without fragment streaming)
    ToolCallComplete(ToolCallRequest),
    /// The vendor reported why generation stopped
    Stop {
        reason: Option<String>,
        stop_sequence: Option<String>,
    },
    /// Opaque vendor state needed to continue the conversation
    VendorState(Value),
}

/// Stream of decoded vendor events
pub type EventStream = BoxStream<'static, Result<VendorEvent>>;

/// What one completed streaming round produced
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoundOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: Option<String>,
    pub vendor_state: Option<Value>,
}

/// A tool call paired with its result text
#[derive(Clone, Debug, PartialEq)]
pub struct ToolExchange {
    pub call: ToolCallRequest,
    pub result: String,
}

/// Strategy trait for LLM vendors
///
/// Implement this trait to add support for a new wire protocol.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Adapter capabilities, pricing and retry policy
    fn info(&self) -> &AdapterInfo;

    /// Convert a canonical request into the vendor's request body.
    ///
    /// Fails with [`AgentError::InvalidConversation`] when the history is
    /// not acceptable to this vendor.
    fn build_request(&self, request: &GenerationRequest) -> Result<Value>;

    /// Send the body and decode the streamed response
    async fn open_stream(&self, body: &Value) -> Result<EventStream>;

    /// Tool calls requested by a finished round
    fn detect_tool_call(&self, round: &RoundOutcome) -> Vec<ToolCallRequest> {
        round.tool_calls.clone()
    }

    /// Append the vendor-specific call/result message pair to `body`.
    ///
    /// Every call in `exchanges` must appear with its correlation id before
    /// the body is sent again.
    fn reconcile_tool_results(
        &self,
        body: &mut Value,
        round: &RoundOutcome,
        exchanges: &[ToolExchange],
    ) -> Result<()>;
}

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-request accumulation of streamed text and tool-call fragments.
///
/// At most one tool call is assembled at a time; completed calls are queued
/// in arrival order.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    stop_sequences: Vec<String>,
    stopped: bool,
    pending: Option<PendingCall>,
    completed: Vec<ToolCallRequest>,
    stop_reason: Option<String>,
    vendor_state: Option<Value>,
}

impl StreamAccumulator {
    pub fn new(stop_sequences: Vec<String>) -> Self {
        Self {
            stop_sequences: stop_sequences.into_iter().filter(|s| !s.is_empty()).collect(),
            ..Self::default()
        }
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Apply one event; returns the newly visible text, if any
    pub fn apply(&mut self, event: VendorEvent) -> Result<Option<String>> {
        match event {
            VendorEvent::TextDelta(delta) => Ok(self.push_text(&delta)),
            VendorEvent::ToolCallStart { id, name } => {
                self.finish_pending()?;
                self.pending = Some(PendingCall {
                    id,
                    name,
                    arguments: String::new(),
                });
                Ok(None)
            }
            VendorEvent::ToolCallArgsDelta(fragment) => {
                match &mut self.pending {
                    Some(pending) => pending.arguments.push_str(&fragment),
                    None => tracing::warn!("Argument fragment outside a tool call; ignored"),
                }
                Ok(None)
            }
            VendorEvent::ToolCallEnd => {
                self.finish_pending()?;
                Ok(None)
            }
            VendorEvent::ToolCallComplete(call) => {
                self.finish_pending()?;
                self.completed.push(call);
                Ok(None)
            }
            VendorEvent::Stop {
                reason,
                stop_sequence,
            } => {
                self.finish_pending()?;
                if reason.is_some() {
                    self.stop_reason = reason;
                }
                match stop_sequence {
                    Some(seq) if !self.stopped && !seq.is_empty() => {
                        self.stopped = true;
                        self.text.push_str(&seq);
                        Ok(Some(seq))
                    }
                    _ => Ok(None),
                }
            }
            VendorEvent::VendorState(state) => {
                self.vendor_state = Some(state);
                Ok(None)
            }
        }
    }

    fn push_text(&mut self, delta: &str) -> Option<String> {
        if self.stopped || delta.is_empty() {
            return None;
        }
        let before = self.text.len();
        self.text.push_str(delta);

        let cut = self
            .stop_sequences
            .iter()
            .filter_map(|seq| self.text.find(seq.as_str()).map(|idx| idx + seq.len()))
            .min();
        if let Some(cut) = cut {
            self.stopped = true;
            self.stop_reason.get_or_insert_with(|| "stop_sequence".into());
            self.text.truncate(cut);
        }

        let visible = &self.text[before.min(self.text.len())..];
        (!visible.is_empty()).then(|| visible.to_string())
    }

    fn finish_pending(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let arguments = if pending.arguments.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str::<Map<String, Value>>(&pending.arguments).map_err(|e| {
                AgentError::Parse(format!(
                    "Arguments of tool call {} are not a JSON object: {e}",
                    pending.name
                ))
            })?
        };
        self.completed.push(ToolCallRequest {
            id: pending.id,
            name: pending.name,
            arguments,
        });
        Ok(())
    }

    /// Close the round
    pub fn finish(mut self) -> Result<RoundOutcome> {
        self.finish_pending()?;
        Ok(RoundOutcome {
            text: self.text,
            tool_calls: self.completed,
            stop_reason: self.stop_reason,
            vendor_state: self.vendor_state,
        })
    }
}
