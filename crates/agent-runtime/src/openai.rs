//! OpenAI-compatible Chat Completions adapter
//!
//! One implementation serves OpenAI itself and every server that speaks the
//! same protocol: xAI Grok, Maritaca, Bedrock's OpenAI endpoint and local
//! Ollama / vLLM servers. Presets differ only in endpoint, key and limits.

use agent_core::message::{Content, ContentBlock, Message, Role};
use agent_core::provider::{
    AdapterInfo, EventStream, GenerationRequest, Pricing, RoundOutcome, ToolExchange,
    VendorAdapter, VendorEvent,
};
use agent_core::{AgentError, Result, RetryPolicy};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use std::time::Duration;

use crate::config::{OpenAiConfig, RuntimeConfig, endpoint};
use crate::http;
use crate::sse::{SseEvent, sse_events};

const DONE: &str = "[DONE]";

/// Servers reachable through the Chat Completions protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenAiPreset {
    OpenAi,
    Grok,
    Maritaca,
    BedrockOpenAi,
    Ollama,
    Vllm,
}

impl OpenAiPreset {
    /// Vendor label used in logs
    pub const fn label(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Grok => "Grok",
            Self::Maritaca => "Maritaca",
            Self::BedrockOpenAi => "Bedrock (OpenAI API)",
            Self::Ollama => "Ollama",
            Self::Vllm => "vLLM",
        }
    }

    /// Connection settings for this preset
    pub fn config(self, runtime: &RuntimeConfig) -> OpenAiConfig {
        let base = OpenAiConfig {
            timeout: runtime.request_timeout,
            ..OpenAiConfig::default()
        };
        match self {
            Self::OpenAi => OpenAiConfig {
                base_url: runtime.openai_base_url.clone(),
                api_key: runtime.openai_api_key.clone(),
                ..base
            },
            Self::Grok => OpenAiConfig {
                base_url: runtime.grok_base_url.clone(),
                api_key: runtime.grok_api_key.clone(),
                ..base
            },
            Self::Maritaca => OpenAiConfig {
                base_url: runtime.maritaca_base_url.clone(),
                api_key: runtime.maritaca_api_key.clone(),
                retry: RetryPolicy::new(25, Duration::from_secs(60)),
                ..base
            },
            Self::BedrockOpenAi => OpenAiConfig {
                base_url: runtime.bedrock_openai_url.clone(),
                api_key: runtime.bedrock_api_key.clone(),
                ..base
            },
            Self::Ollama => OpenAiConfig {
                base_url: endpoint(&runtime.ollama_host, "/v1"),
                api_key: Some("ollama".into()),
                max_tokens: 4096,
                ..base
            },
            Self::Vllm => OpenAiConfig {
                base_url: endpoint(&runtime.vllm_host, "/v1"),
                api_key: Some("vllm".into()),
                max_tokens: 2048,
                ..base
            },
        }
    }

    /// Whether the server is expected to honour structured tool calls
    pub const fn supports_tools(self) -> bool {
        !matches!(self, Self::Vllm)
    }
}

/// Adapter for Chat Completions servers
pub struct OpenAiAdapter {
    info: AdapterInfo,
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        pricing: Pricing,
        config: OpenAiConfig,
        supports_tools: bool,
    ) -> Result<Self> {
        let client = http::client(config.timeout)?;
        Ok(Self {
            info: AdapterInfo {
                name: name.into(),
                model: model.into(),
                supports_tools,
                strict_alternation: false,
                supports_prefill: true,
                pricing,
                retry: config.retry.clone(),
            },
            config,
            client,
        })
    }

    /// Build an adapter from a preset
    pub fn preset(
        preset: OpenAiPreset,
        model: impl Into<String>,
        pricing: Pricing,
        runtime: &RuntimeConfig,
    ) -> Result<Self> {
        Self::new(
            preset.label(),
            model,
            pricing,
            preset.config(runtime),
            preset.supports_tools(),
        )
    }

    /// Set `reasoning_effort` for reasoning models
    #[must_use]
    pub fn reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.config.reasoning_effort = Some(effort.into());
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let key = self.config.api_key.as_deref().ok_or_else(|| {
            AgentError::Config(format!("No API key configured for {}", self.info.name))
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| AgentError::Config("API key is not a valid header".into()))?,
        );
        Ok(headers)
    }
}

fn wire_messages(message: &Message) -> Vec<Value> {
    match (&message.role, &message.content) {
        (Role::System, content) => vec![json!({ "role": "system", "content": content.text() })],
        (Role::User, Content::Text(text)) => vec![json!({ "role": "user", "content": text })],
        (Role::User, Content::Blocks(blocks)) => {
            let parts: Vec<Value> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentBlock::Image { media_type, data } => Some(json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{media_type};base64,{data}") },
                    })),
                    _ => None,
                })
                .collect();
            vec![json!({ "role": "user", "content": parts })]
        }
        (Role::Assistant, content) => {
            let calls: Vec<Value> = message
                .tool_calls()
                .map(|(id, name, arguments)| wire_tool_call(id, name, &Value::Object(arguments.clone())))
                .collect();
            let text = content.text();
            if calls.is_empty() {
                vec![json!({ "role": "assistant", "content": text })]
            } else {
                vec![assistant_with_calls(&text, calls)]
            }
        }
        (Role::Tool, content) => content
            .blocks()
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    call_id, content, ..
                } => Some(json!({ "role": "tool", "tool_call_id": call_id, "content": content })),
                _ => None,
            })
            .collect(),
    }
}

fn wire_tool_call(id: &str, name: &str, arguments: &Value) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": arguments.to_string() },
    })
}

fn assistant_with_calls(text: &str, calls: Vec<Value>) -> Value {
    let content = if text.trim().is_empty() {
        Value::Null
    } else {
        json!(text)
    };
    json!({ "role": "assistant", "content": content, "tool_calls": calls })
}

/// Per-stream decoding state
#[derive(Debug, Default)]
pub struct StreamDecoder {
    open_call: Option<u64>,
    done: bool,
}

impl StreamDecoder {
    /// Translate one SSE event into canonical events
    pub fn decode(&mut self, event: &SseEvent) -> Result<Vec<VendorEvent>> {
        let data = event.data.trim();
        if self.done || data.is_empty() {
            return Ok(Vec::new());
        }
        if data == DONE {
            self.done = true;
            return Ok(self.close_call().into_iter().collect());
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| AgentError::Parse(format!("invalid completion chunk: {e}")))?;
        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown error").to_string();
            return Err(AgentError::Provider(message));
        }

        let mut events = Vec::new();
        let Some(choice) = chunk["choices"].get(0) else {
            return Ok(events);
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            events.push(VendorEvent::TextDelta(text.to_string()));
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let function = &call["function"];
                if self.open_call != Some(index) {
                    events.extend(self.close_call());
                    self.open_call = Some(index);
                    let id = call["id"]
                        .as_str()
                        .filter(|id| !id.is_empty())
                        .map_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()), String::from);
                    events.push(VendorEvent::ToolCallStart {
                        id,
                        name: function["name"].as_str().unwrap_or_default().to_string(),
                    });
                }
                if let Some(args) = function["arguments"].as_str().filter(|a| !a.is_empty()) {
                    events.push(VendorEvent::ToolCallArgsDelta(args.to_string()));
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            events.extend(self.close_call());
            events.push(VendorEvent::Stop {
                reason: Some(reason.to_string()),
                stop_sequence: None,
            });
        }
        Ok(events)
    }

    fn close_call(&mut self) -> Option<VendorEvent> {
        self.open_call.take().map(|_| VendorEvent::ToolCallEnd)
    }
}

#[async_trait]
impl VendorAdapter for OpenAiAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Value> {
        request.messages.validate(self.info.strict_alternation)?;

        let mut messages: Vec<Value> = request
            .messages
            .messages()
            .iter()
            .flat_map(wire_messages)
            .collect();
        if let Some(postpend) = &request.postpend {
            if request.tools.is_empty() {
                messages.push(json!({ "role": "assistant", "content": postpend }));
            }
        }

        let mut body = json!({
            "model": self.info.model,
            "stream": true,
            "messages": messages,
        });
        match &self.config.reasoning_effort {
            Some(effort) => {
                body["reasoning_effort"] = json!(effort);
                body["max_completion_tokens"] = json!(self.config.max_tokens);
            }
            None => {
                body["max_tokens"] = json!(self.config.max_tokens);
                body["temperature"] = json!(self.config.temperature);
            }
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema(),
                        },
                    })
                })
                .collect());
        }
        Ok(body)
    }

    async fn open_stream(&self, body: &Value) -> Result<EventStream> {
        let url = endpoint(&self.config.base_url, "/chat/completions");
        let response = http::post_json(&self.client, &url, self.headers()?, body).await?;
        let mut frames = sse_events(response.bytes_stream());

        Ok(Box::pin(stream! {
            let mut decoder = StreamDecoder::default();
            while let Some(frame) = frames.next().await {
                match frame.and_then(|f| decoder.decode(&f)) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }))
    }

    fn reconcile_tool_results(
        &self,
        body: &mut Value,
        round: &RoundOutcome,
        exchanges: &[ToolExchange],
    ) -> Result<()> {
        let messages = body
            .get_mut("messages")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| AgentError::Other("request body has no messages".into()))?;

        let calls = exchanges
            .iter()
            .map(|ex| wire_tool_call(&ex.call.id, &ex.call.name, &Value::Object(ex.call.arguments.clone())))
            .collect();
        messages.push(assistant_with_calls(&round.text, calls));
        messages.extend(exchanges.iter().map(|ex| {
            json!({ "role": "tool", "tool_call_id": ex.call.id, "content": ex.result })
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::generation::{GenerationEvent, run_generation};
    use agent_core::message::Conversation;
    use agent_core::testing::echo_registry;
    use agent_core::ToolDispatcher;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAiAdapter {
        OpenAiAdapter::new(
            "Ollama",
            "qwen3:8b",
            Pricing::default(),
            OpenAiConfig {
                base_url: format!("{}/v1", server.uri()),
                api_key: Some("ollama".into()),
                retry: RetryPolicy::new(1, Duration::from_millis(10)),
                ..OpenAiConfig::default()
            },
            true,
        )
        .unwrap()
    }

    fn sse(chunks: &[Value]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn text_chunk(text: &str) -> Value {
        json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    }

    #[test]
    fn test_presets() {
        let runtime = RuntimeConfig::default();
        let ollama = OpenAiPreset::Ollama.config(&runtime);
        assert_eq!(ollama.base_url, "http://localhost:11434/v1");
        assert_eq!(ollama.max_tokens, 4096);
        assert_eq!(OpenAiPreset::Maritaca.config(&runtime).retry.max_retries, 25);
        assert_eq!(OpenAiPreset::OpenAi.config(&runtime).retry.max_retries, 3);
        assert!(!OpenAiPreset::Vllm.supports_tools());
    }

    #[tokio::test]
    async fn test_request_shape() {
        let server = MockServer::start().await;
        let adapter = adapter(&server).reasoning_effort("low");
        let mut conv = Conversation::with_system_prompt("sys");
        conv.push(Message::user_with_images("Describe", &["QUJD".to_string()]));
        let body = adapter
            .build_request(&GenerationRequest::new(conv).tools(echo_registry().describe_all()))
            .unwrap();

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"][0]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["reasoning_effort"], "low");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_canonical_tool_history_is_translated() {
        let mut arguments = serde_json::Map::new();
        arguments.insert("text".into(), json!("hi"));
        let assistant = Message::assistant(Content::Blocks(vec![ContentBlock::ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments,
        }]));
        let wire = wire_messages(&assistant);
        assert_eq!(wire[0]["content"], Value::Null);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], "{\"text\":\"hi\"}");

        let results = Message::new(
            Role::Tool,
            Content::Blocks(vec![
                ContentBlock::ToolResult { call_id: "a".into(), name: "x".into(), content: "1".into() },
                ContentBlock::ToolResult { call_id: "b".into(), name: "x".into(), content: "2".into() },
            ]),
        );
        let wire = wire_messages(&results);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[1], json!({"role": "tool", "tool_call_id": "b", "content": "2"}));
    }

    #[test]
    fn test_decode_whole_tool_call_chunk() {
        let mut decoder = StreamDecoder::default();
        let chunk = json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"name": "echo", "arguments": "{\"text\":\"x\"}"}}
        ]}, "finish_reason": "tool_calls"}]});
        let events = decoder
            .decode(&SseEvent { event: None, data: chunk.to_string() })
            .unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], VendorEvent::ToolCallStart { id, name } if id.starts_with("call_") && name == "echo"));
        assert_eq!(events[2], VendorEvent::ToolCallEnd);
        assert!(decoder.decode(&SseEvent { event: None, data: DONE.into() }).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer ollama"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[
                    text_chunk("Hello"),
                    text_chunk(", world"),
                    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
                ]),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let adapter: Arc<dyn VendorAdapter> = Arc::new(adapter(&server));
        let mut conv = Conversation::new();
        conv.push(Message::user("Hi"));
        let events: Vec<GenerationEvent> =
            run_generation(adapter, GenerationRequest::new(conv), None).collect().await;

        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "Hello, world");
        assert!(matches!(events.last(), Some(GenerationEvent::Done(o)) if o.text == "Hello, world"));
    }

    #[tokio::test]
    async fn test_fragmented_tool_call_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("tool_call_id"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[
                    text_chunk("Echoed."),
                    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
                ]),
                "text/event-stream",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[
                    json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "id": "call_abc", "type": "function", "function": {"name": "echo", "arguments": ""}}
                    ]}, "finish_reason": null}]}),
                    json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "function": {"arguments": "{\"text\": "}}
                    ]}, "finish_reason": null}]}),
                    json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "function": {"arguments": "\"ping\"}"}}
                    ]}, "finish_reason": null}]}),
                    json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
                ]),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let adapter: Arc<dyn VendorAdapter> = Arc::new(adapter(&server));
        let mut conv = Conversation::new();
        conv.push(Message::user("Echo ping"));
        let request = GenerationRequest::new(conv).tools(echo_registry().describe_all());
        let events: Vec<GenerationEvent> =
            run_generation(adapter, request, Some(ToolDispatcher::new(echo_registry())))
                .collect()
                .await;

        assert!(matches!(events.last(), Some(GenerationEvent::Done(o)) if o.text == "Echoed."));
        let requests = server.received_requests().await.unwrap();
        let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
        let messages = second["messages"].as_array().unwrap();
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_abc");
        assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], "{\"text\":\"ping\"}");
        assert_eq!(messages[2], json!({"role": "tool", "tool_call_id": "call_abc", "content": "ping"}));
    }
}
