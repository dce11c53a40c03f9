//! Anthropic Messages API adapter
//!
//! Streams `/v1/messages` over SSE. Tool calls arrive as `tool_use` content
//! blocks whose input is streamed as partial JSON.

use agent_core::message::{Content, ContentBlock, Message, Role};
use agent_core::provider::{
    AdapterInfo, EventStream, GenerationRequest, Pricing, RoundOutcome, ToolExchange,
    VendorAdapter, VendorEvent,
};
use agent_core::{AgentError, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::config::{AnthropicConfig, endpoint};
use crate::http;
use crate::sse::{SseEvent, sse_events};

const API_VERSION: &str = "2023-06-01";

/// Adapter for Claude models served by Anthropic
pub struct AnthropicAdapter {
    info: AdapterInfo,
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(model: impl Into<String>, pricing: Pricing, config: AnthropicConfig) -> Result<Self> {
        let client = http::client(config.timeout)?;
        Ok(Self {
            info: AdapterInfo {
                name: "Anthropic".into(),
                model: model.into(),
                supports_tools: true,
                strict_alternation: true,
                supports_prefill: true,
                pricing,
                retry: config.retry.clone(),
            },
            config,
            client,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| AgentError::Config("ANTHROPIC_API_KEY is not set".into()))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(key)
                .map_err(|_| AgentError::Config("ANTHROPIC_API_KEY is not a valid header".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    fn system_field(&self, prompt: &str) -> Value {
        if self.config.caching {
            json!([{
                "type": "text",
                "text": prompt,
                "cache_control": { "type": "ephemeral" },
            }])
        } else {
            json!(prompt)
        }
    }

    fn tools_field(&self, request: &GenerationRequest) -> Value {
        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema(),
                })
            })
            .collect();
        if self.config.caching {
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
        Value::Array(tools)
    }
}

fn wire_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Image { media_type, data } => Some(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        })),
        ContentBlock::ToolCall {
            id,
            name,
            arguments,
        } => Some(json!({ "type": "tool_use", "id": id, "name": name, "input": arguments })),
        ContentBlock::ToolResult {
            call_id, content, ..
        } => Some(json!({ "type": "tool_result", "tool_use_id": call_id, "content": content })),
    }
}

fn wire_message(message: &Message) -> Value {
    let role = match message.role.side() {
        Role::Assistant => "assistant",
        _ => "user",
    };
    let content = match &message.content {
        Content::Text(text) => json!(text),
        Content::Blocks(blocks) => Value::Array(blocks.iter().filter_map(wire_block).collect()),
    };
    json!({ "role": role, "content": content })
}

fn messages_mut(body: &mut Value) -> Result<&mut Vec<Value>> {
    body.get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| AgentError::Other("request body has no messages".into()))
}

/// Per-stream decoding state
#[derive(Debug, Default)]
pub struct StreamDecoder {
    in_tool_block: bool,
}

impl StreamDecoder {
    /// Translate one SSE event into canonical events
    pub fn decode(&mut self, event: &SseEvent) -> Result<Vec<VendorEvent>> {
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let payload: Value = serde_json::from_str(&event.data)
            .map_err(|e| AgentError::Parse(format!("invalid Anthropic event: {e}")))?;
        let kind = payload["type"].as_str().or(event.event.as_deref()).unwrap_or_default();

        let events = match kind {
            "content_block_start" => {
                let block = &payload["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.in_tool_block = true;
                        vec![VendorEvent::ToolCallStart {
                            id: str_field(block, "id"),
                            name: str_field(block, "name"),
                        }]
                    }
                    Some("text") => {
                        self.in_tool_block = false;
                        text_event(block["text"].as_str())
                    }
                    _ => {
                        self.in_tool_block = false;
                        Vec::new()
                    }
                }
            }
            "content_block_delta" => {
                let delta = &payload["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => text_event(delta["text"].as_str()),
                    Some("input_json_delta") => delta["partial_json"]
                        .as_str()
                        .map(|p| vec![VendorEvent::ToolCallArgsDelta(p.to_string())])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "content_block_stop" if self.in_tool_block => {
                self.in_tool_block = false;
                vec![VendorEvent::ToolCallEnd]
            }
            "message_delta" => {
                let delta = &payload["delta"];
                vec![VendorEvent::Stop {
                    reason: delta["stop_reason"].as_str().map(String::from),
                    stop_sequence: delta["stop_sequence"].as_str().map(String::from),
                }]
            }
            "error" => {
                let error = &payload["error"];
                let message = error["message"].as_str().unwrap_or("unknown error").to_string();
                return Err(match error["type"].as_str() {
                    Some("overloaded_error" | "api_error") => AgentError::ProviderUnavailable(message),
                    Some("rate_limit_error") => AgentError::RateLimited(message),
                    _ => AgentError::Provider(message),
                });
            }
            _ => Vec::new(),
        };
        Ok(events)
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}

fn text_event(text: Option<&str>) -> Vec<VendorEvent> {
    match text {
        Some(t) if !t.is_empty() => vec![VendorEvent::TextDelta(t.to_string())],
        _ => Vec::new(),
    }
}

#[async_trait]
impl VendorAdapter for AnthropicAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Value> {
        request.messages.validate(self.info.strict_alternation)?;

        let mut messages: Vec<Value> = request.messages.turns().iter().map(wire_message).collect();
        if let Some(postpend) = &request.postpend {
            if request.tools.is_empty() {
                messages.push(json!({ "role": "assistant", "content": postpend }));
            } else {
                tracing::debug!("Prefill is not sent alongside tools");
            }
        }

        let mut body = json!({
            "model": self.info.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": true,
            "messages": messages,
        });
        if let Some(system) = request.messages.system_prompt() {
            body["system"] = self.system_field(&system.text());
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = self.tools_field(request);
        }
        Ok(body)
    }

    async fn open_stream(&self, body: &Value) -> Result<EventStream> {
        let url = endpoint(&self.config.base_url, "/v1/messages");
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
        let messages = messages_mut(body)?;
        if messages.last().is_some_and(|m| m["role"] == "assistant") {
            messages.pop();
        }

        let mut content = Vec::new();
        if !round.text.trim().is_empty() {
            content.push(json!({ "type": "text", "text": round.text }));
        }
        content.extend(exchanges.iter().map(|ex| {
            json!({
                "type": "tool_use",
                "id": ex.call.id,
                "name": ex.call.name,
                "input": ex.call.arguments,
            })
        }));
        messages.push(json!({ "role": "assistant", "content": content }));

        let results: Vec<Value> = exchanges
            .iter()
            .map(|ex| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": ex.call.id,
                    "content": ex.result,
                })
            })
            .collect();
        messages.push(json!({ "role": "user", "content": results }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::generation::{GenerationEvent, run_generation};
    use agent_core::message::Conversation;
    use agent_core::testing::echo_registry;
    use agent_core::{RetryPolicy, ToolDispatcher};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer, caching: bool) -> AnthropicAdapter {
        AnthropicAdapter::new(
            "claude-sonnet-4-5-20250929",
            Pricing::new(3.0, 15.0),
            AnthropicConfig {
                base_url: server.uri(),
                api_key: Some("test-key".into()),
                caching,
                retry: RetryPolicy::new(2, Duration::from_millis(10)),
                ..AnthropicConfig::default()
            },
        )
        .unwrap()
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap()))
            .collect()
    }

    fn conversation() -> Conversation {
        let mut conv = Conversation::with_system_prompt("You are helpful.");
        conv.push(Message::user("Repeat hello"));
        conv
    }

    #[tokio::test]
    async fn test_request_shape_with_caching() {
        let server = MockServer::start().await;
        let adapter = adapter(&server, true);
        let request = GenerationRequest::new(conversation())
            .tools(echo_registry().describe_all())
            .stop_sequence("</function_calls>");
        let body = adapter.build_request(&request).unwrap();

        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["tools"][0]["name"], "echo");
        assert_eq!(body["tools"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["tools"][0]["input_schema"]["required"][0], "text");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["stop_sequences"][0], "</function_calls>");
    }

    #[tokio::test]
    async fn test_prefill_and_images() {
        let server = MockServer::start().await;
        let adapter = adapter(&server, false);
        let mut conv = Conversation::with_system_prompt("sys");
        conv.push(Message::user_with_images("What is this?", &["AAAA".to_string()]));
        let body = adapter
            .build_request(&GenerationRequest::new(conv).postpend("<scratchpad>"))
            .unwrap();

        assert_eq!(body["system"], "sys");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"][0]["type"], "image");
        assert_eq!(messages[0]["content"][0]["source"]["media_type"], "image/jpeg");
        assert_eq!(messages[0]["content"][1]["text"], "What is this?");
        assert_eq!(messages[1], json!({ "role": "assistant", "content": "<scratchpad>" }));
    }

    #[tokio::test]
    async fn test_rejects_bad_alternation() {
        let server = MockServer::start().await;
        let adapter = adapter(&server, false);
        let conv = Conversation::from_messages(vec![Message::user("a"), Message::user("b")]);
        assert!(matches!(
            adapter.build_request(&GenerationRequest::new(conv)),
            Err(AgentError::InvalidConversation(_))
        ));
    }

    #[test]
    fn test_decode_stream_events() {
        let mut decoder = StreamDecoder::default();
        let frames = [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "echo", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"text\":"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use", "stop_sequence": null}}),
        ];
        let events: Vec<VendorEvent> = frames
            .iter()
            .flat_map(|f| {
                decoder
                    .decode(&SseEvent { event: None, data: f.to_string() })
                    .unwrap()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                VendorEvent::TextDelta("Hi".into()),
                VendorEvent::ToolCallStart { id: "toolu_1".into(), name: "echo".into() },
                VendorEvent::ToolCallArgsDelta("{\"text\":".into()),
                VendorEvent::ToolCallEnd,
                VendorEvent::Stop { reason: Some("tool_use".into()), stop_sequence: None },
            ]
        );
    }

    #[test]
    fn test_overloaded_error_is_unavailable() {
        let mut decoder = StreamDecoder::default();
        let err = decoder
            .decode(&SseEvent {
                event: Some("error".into()),
                data: json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}).to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_native_tool_round_trip() {
        let server = MockServer::start().await;

        let final_round = sse(&[
            json!({"type": "message_start", "message": {"id": "msg_2"}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "The tool said hello."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}}),
            json!({"type": "message_stop"}),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_string_contains("tool_result"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(final_round, "text/event-stream"))
            .mount(&server)
            .await;

        let tool_round = sse(&[
            json!({"type": "message_start", "message": {"id": "msg_1"}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me check."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_01", "name": "echo", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"te"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "xt\": \"hello\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use", "stop_sequence": null}}),
            json!({"type": "message_stop"}),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(tool_round, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter: Arc<dyn VendorAdapter> = Arc::new(adapter(&server, true));
        let request =
            GenerationRequest::new(conversation()).tools(echo_registry().describe_all());
        let events: Vec<GenerationEvent> = run_generation(
            adapter,
            request,
            Some(ToolDispatcher::new(echo_registry())),
        )
        .collect()
        .await;

        let Some(GenerationEvent::Done(outcome)) = events.last() else {
            panic!("expected Done, got {events:?}");
        };
        assert_eq!(outcome.text, "The tool said hello.");
        assert_eq!(outcome.exchange_messages.len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            GenerationEvent::ToolResult { result, .. } if result == "hello"
        )));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
        let messages = second["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["text"], "Let me check.");
        assert_eq!(messages[1]["content"][1]["id"], "toolu_01");
        assert_eq!(messages[1]["content"][1]["input"]["text"], "hello");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_01");
        assert_eq!(messages[2]["content"][0]["content"], "hello");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let adapter: Arc<dyn VendorAdapter> = Arc::new(adapter(&server, false));
        let events: Vec<GenerationEvent> =
            run_generation(adapter, GenerationRequest::new(conversation()), None)
                .collect()
                .await;

        assert!(matches!(events[0], GenerationEvent::Retry { attempt: 1, max_retries: 2, .. }));
        assert!(matches!(events.last(), Some(GenerationEvent::Failed(_))));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_retry() {
        let server = MockServer::start().await;
        let adapter: Arc<dyn VendorAdapter> = Arc::new(
            AnthropicAdapter::new(
                "claude-haiku-4-5-20251001",
                Pricing::default(),
                AnthropicConfig {
                    base_url: server.uri(),
                    ..AnthropicConfig::default()
                },
            )
            .unwrap(),
        );
        let events: Vec<GenerationEvent> =
            run_generation(adapter, GenerationRequest::new(conversation()), None)
                .collect()
                .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], GenerationEvent::Failed(_)));
    }
}
