//! Test doubles
//!
//! [`ScriptedAdapter`] replays canned event rounds in order, optionally
//! failing the first N stream openings, and records every body it is sent.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::provider::{
    AdapterInfo, EventStream, GenerationRequest, Pricing, RetryPolicy, RoundOutcome,
    ToolExchange, VendorAdapter, VendorEvent,
};
use crate::tool::{ParamType, ParameterSchema, Tool, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};

/// In-process adapter that replays scripted rounds
pub struct ScriptedAdapter {
    info: AdapterInfo,
    rounds: Mutex<VecDeque<Vec<VendorEvent>>>,
    failures_left: Mutex<u32>,
    bodies: Mutex<Vec<Value>>,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            info: AdapterInfo {
                name: "Scripted".into(),
                model: "scripted-1".into(),
                supports_tools: false,
                strict_alternation: false,
                supports_prefill: true,
                pricing: Pricing::new(1.0, 2.0),
                retry: RetryPolicy::default(),
            },
            rounds: Mutex::new(VecDeque::new()),
            failures_left: Mutex::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    /// Queue the events of one streaming round
    #[must_use]
    pub fn round(self, events: Vec<VendorEvent>) -> Self {
        lock(&self.rounds).push_back(events);
        self
    }

    /// Fail the next `n` stream openings with a transport error
    #[must_use]
    pub fn fail_times(self, n: u32) -> Self {
        *lock(&self.failures_left) = n;
        self
    }

    #[must_use]
    pub const fn tools_supported(mut self) -> Self {
        self.info.supports_tools = true;
        self
    }

    #[must_use]
    pub const fn strict(mut self) -> Self {
        self.info.strict_alternation = true;
        self
    }

    /// Behave like a vendor without assistant prefill
    #[must_use]
    pub const fn no_prefill(mut self) -> Self {
        self.info.supports_prefill = false;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.info.retry = retry;
        self
    }

    /// Bodies passed to `open_stream`, in order
    pub fn sent_bodies(&self) -> Vec<Value> {
        lock(&self.bodies).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl VendorAdapter for ScriptedAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Value> {
        request.messages.validate(self.info.strict_alternation)?;
        Ok(json!({
            "model": self.info.model,
            "messages": serde_json::to_value(request.messages.messages())?,
            "postpend": request.postpend,
            "stop_sequences": request.stop_sequences,
            "tools": request.tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
        }))
    }

    async fn open_stream(&self, body: &Value) -> Result<EventStream> {
        lock(&self.bodies).push(body.clone());
        {
            let mut failures = lock(&self.failures_left);
            if *failures > 0 {
                *failures -= 1;
                return Err(AgentError::ProviderUnavailable("scripted failure".into()));
            }
        }
        let events = lock(&self.rounds).pop_front().unwrap_or_default();
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    fn reconcile_tool_results(
        &self,
        body: &mut Value,
        _round: &RoundOutcome,
        exchanges: &[ToolExchange],
    ) -> Result<()> {
        let results = body
            .as_object_mut()
            .ok_or_else(|| AgentError::Other("body is not an object".into()))?
            .entry("tool_results")
            .or_insert_with(|| json!([]));
        if let Value::Array(items) = results {
            items.extend(exchanges.iter().map(|ex| {
                json!({ "call_id": ex.call.id, "content": ex.result })
            }));
        }
        Ok(())
    }
}

/// Echoes its `text` parameter
pub struct EchoTool {
    descriptor: ToolDescriptor,
}

impl Default for EchoTool {
    fn default() -> Self {
        Self {
            descriptor: ToolDescriptor::new("echo", "Repeat the given text verbatim").param(
                ParameterSchema::required("text", ParamType::String, "Text to repeat"),
            ),
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput> {
        Ok(ToolOutput::text(args.str("text").unwrap_or_default()))
    }
}

/// Registry holding only [`EchoTool`]
pub fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool::default());
    registry
}
