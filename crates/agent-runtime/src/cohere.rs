//! Cohere Chat v1 adapter
//!
//! The stream is newline-delimited JSON. Tool calls arrive whole and carry
//! no id, so one is minted per call. Follow-up rounds send the results in
//! `tool_results` with an empty `message`.

use agent_core::message::{Content, ContentBlock, Message, Role};
use agent_core::provider::{
    AdapterInfo, EventStream, GenerationRequest, Pricing, RoundOutcome, ToolCallRequest,
    ToolExchange, VendorAdapter, VendorEvent,
};
use agent_core::tool::{ParamType, ToolDescriptor};
use agent_core::{AgentError, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::warn;

use crate::config::{CohereConfig, endpoint};
use crate::http;
use crate::sse::json_lines;

/// Adapter for Cohere Command models
pub struct CohereAdapter {
    info: AdapterInfo,
    config: CohereConfig,
    client: reqwest::Client,
}

impl CohereAdapter {
    pub fn new(model: impl Into<String>, pricing: Pricing, config: CohereConfig) -> Result<Self> {
        let client = http::client(config.timeout)?;
        Ok(Self {
            info: AdapterInfo {
                name: "Cohere".into(),
                model: model.into(),
                supports_tools: true,
                strict_alternation: false,
                supports_prefill: false,
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
            .ok_or_else(|| AgentError::Config("COHERE_API_KEY is not set".into()))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| AgentError::Config("COHERE_API_KEY is not a valid header".into()))?,
        );
        Ok(headers)
    }
}

const fn cohere_type(param_type: ParamType) -> &'static str {
    match param_type {
        ParamType::String => "str",
        ParamType::Integer => "int",
        ParamType::Number => "float",
        ParamType::Boolean => "bool",
    }
}

/// Cohere tool definition with renamed parameter types
pub fn tool_definition(tool: &ToolDescriptor) -> Value {
    let definitions: Map<String, Value> = tool
        .parameters
        .iter()
        .map(|p| {
            let mut description = p.description.clone();
            if let Some(values) = &p.enum_values {
                description = format!("{description} Allowed values: {}.", values.join(", "));
            }
            (
                p.name.clone(),
                json!({
                    "description": description,
                    "type": cohere_type(p.param_type),
                    "required": p.required,
                }),
            )
        })
        .collect();
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameter_definitions": definitions,
    })
}

fn wire_call(name: &str, parameters: &Map<String, Value>) -> Value {
    json!({ "name": name, "parameters": parameters })
}

fn tool_result_entry(name: &str, parameters: &Map<String, Value>, output: &str) -> Value {
    json!({
        "call": wire_call(name, parameters),
        "outputs": [{ "output": output }],
    })
}

/// Canonical turns (minus the final user message) as `chat_history`
fn chat_history(turns: &[Message]) -> Vec<Value> {
    let mut calls: HashMap<&str, (&str, &Map<String, Value>)> = HashMap::new();
    let mut history = Vec::new();
    for message in turns {
        match message.role {
            Role::System => {}
            Role::User => {
                if has_images(&message.content) {
                    warn!("Cohere does not accept images; dropping them from history");
                }
                history.push(json!({ "role": "USER", "message": message.text() }));
            }
            Role::Assistant => {
                let mut entry = json!({ "role": "CHATBOT", "message": message.text() });
                let tool_calls: Vec<Value> = message
                    .tool_calls()
                    .map(|(id, name, arguments)| {
                        calls.insert(id, (name, arguments));
                        wire_call(name, arguments)
                    })
                    .collect();
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                history.push(entry);
            }
            Role::Tool => {
                let empty = Map::new();
                let results: Vec<Value> = message
                    .content
                    .blocks()
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            call_id,
                            name,
                            content,
                        } => {
                            let arguments = calls.get(call_id.as_str()).map_or(&empty, |(_, a)| *a);
                            Some(tool_result_entry(name, arguments, content))
                        }
                        _ => None,
                    })
                    .collect();
                history.push(json!({ "role": "TOOL", "tool_results": results }));
            }
        }
    }
    history
}

fn has_images(content: &Content) -> bool {
    matches!(content, Content::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
}

/// Translate one stream line into canonical events
pub fn decode_line(line: &Value) -> Result<Vec<VendorEvent>> {
    let events = match line["event_type"].as_str().unwrap_or_default() {
        "text-generation" => match line["text"].as_str() {
            Some(text) if !text.is_empty() => vec![VendorEvent::TextDelta(text.to_string())],
            _ => Vec::new(),
        },
        "tool-calls-generation" => line["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| {
                        VendorEvent::ToolCallComplete(ToolCallRequest {
                            id: uuid::Uuid::new_v4().to_string(),
                            name: call["name"].as_str().unwrap_or_default().to_string(),
                            arguments: call["parameters"].as_object().cloned().unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        "stream-end" => {
            let mut events = Vec::new();
            if let Some(history) = line["response"]["chat_history"].as_array() {
                events.push(VendorEvent::VendorState(Value::Array(history.clone())));
            }
            let reason = line["finish_reason"].as_str().map(String::from);
            if reason.as_deref() == Some("ERROR") {
                return Err(AgentError::Provider("Cohere stream ended with an error".into()));
            }
            events.push(VendorEvent::Stop {
                reason,
                stop_sequence: None,
            });
            events
        }
        _ => Vec::new(),
    };
    Ok(events)
}

#[async_trait]
impl VendorAdapter for CohereAdapter {
    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Value> {
        request.messages.validate(self.info.strict_alternation)?;
        let turns = request.messages.turns();
        let (last, earlier) = turns
            .split_last()
            .ok_or_else(|| AgentError::InvalidConversation("no user message to send".into()))?;
        if has_images(&last.content) {
            warn!("Cohere does not accept images; sending the text only");
        }
        if request.postpend.is_some() {
            tracing::debug!("Cohere has no assistant prefill; postpend not sent");
        }

        let mut body = json!({
            "model": self.info.model,
            "message": last.text(),
            "chat_history": chat_history(earlier),
            "stream": true,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });
        if let Some(system) = request.messages.system_prompt() {
            body["preamble"] = json!(system.text());
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_definition).collect());
        }
        Ok(body)
    }

    async fn open_stream(&self, body: &Value) -> Result<EventStream> {
        let url = endpoint(&self.config.base_url, "/v1/chat");
        let response = http::post_json(&self.client, &url, self.headers()?, body).await?;
        let mut lines = json_lines(response.bytes_stream());

        Ok(Box::pin(stream! {
            while let Some(line) = lines.next().await {
                match line.and_then(|l| decode_line(&l)) {
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
        let object = body
            .as_object_mut()
            .ok_or_else(|| AgentError::Other("request body is not an object".into()))?;

        match &round.vendor_state {
            Some(history @ Value::Array(_)) => {
                object.insert("chat_history".into(), history.clone());
            }
            _ => {
                let message = object.get("message").cloned().unwrap_or_default();
                let calls: Vec<Value> = exchanges
                    .iter()
                    .map(|ex| wire_call(&ex.call.name, &ex.call.arguments))
                    .collect();
                if let Some(Value::Array(history)) = object.get_mut("chat_history") {
                    if message.as_str().is_some_and(|m| !m.is_empty()) {
                        history.push(json!({ "role": "USER", "message": message }));
                    }
                    history.push(json!({
                        "role": "CHATBOT",
                        "message": round.text,
                        "tool_calls": calls,
                    }));
                }
            }
        }

        let results: Vec<Value> = exchanges
            .iter()
            .map(|ex| tool_result_entry(&ex.call.name, &ex.call.arguments, &ex.result))
            .collect();
        object.insert("tool_results".into(), Value::Array(results));
        object.insert("message".into(), json!(""));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::generation::{GenerationEvent, run_generation};
    use agent_core::message::Conversation;
    use agent_core::testing::echo_registry;
    use agent_core::tool::ParameterSchema;
    use agent_core::{RetryPolicy, ToolDispatcher};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> CohereAdapter {
        CohereAdapter::new(
            "command-r-plus",
            Pricing::new(3.0, 15.0),
            CohereConfig {
                base_url: server.uri(),
                api_key: Some("co-key".into()),
                retry: RetryPolicy::new(1, Duration::from_millis(10)),
                ..CohereConfig::default()
            },
        )
        .unwrap()
    }

    fn ndjson(lines: &[Value]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    #[test]
    fn test_parameter_types_are_renamed() {
        let tool = ToolDescriptor::new("do_date_math", "Date arithmetic")
            .param(ParameterSchema::required("deltas", ParamType::Integer, "Offsets"))
            .param(ParameterSchema::optional("ratio", ParamType::Number, "Scale"))
            .param(ParameterSchema::optional("strict", ParamType::Boolean, "Strict"));
        let def = tool_definition(&tool);
        let params = &def["parameter_definitions"];
        assert_eq!(params["deltas"]["type"], "int");
        assert_eq!(params["deltas"]["required"], true);
        assert_eq!(params["ratio"]["type"], "float");
        assert_eq!(params["strict"]["type"], "bool");
    }

    #[tokio::test]
    async fn test_request_shape() {
        let server = MockServer::start().await;
        let mut conv = Conversation::with_system_prompt("Be brief.");
        conv.push(Message::user("first"));
        conv.push(Message::assistant("reply"));
        conv.push(Message::user("second"));
        let body = adapter(&server)
            .build_request(&GenerationRequest::new(conv))
            .unwrap();

        assert_eq!(body["preamble"], "Be brief.");
        assert_eq!(body["message"], "second");
        assert_eq!(
            body["chat_history"],
            json!([
                {"role": "USER", "message": "first"},
                {"role": "CHATBOT", "message": "reply"},
            ])
        );
    }

    #[test]
    fn test_stream_end_carries_history() {
        let events = decode_line(&json!({
            "event_type": "stream-end",
            "finish_reason": "COMPLETE",
            "response": {"chat_history": [{"role": "USER", "message": "hi"}]},
        }))
        .unwrap();
        assert!(matches!(&events[0], VendorEvent::VendorState(Value::Array(h)) if h.len() == 1));
        assert!(matches!(&events[1], VendorEvent::Stop { reason: Some(r), .. } if r == "COMPLETE"));
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(body_string_contains("tool_results"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ndjson(&[
                    json!({"event_type": "stream-start", "generation_id": "g2"}),
                    json!({"event_type": "text-generation", "text": "It said "}),
                    json!({"event_type": "text-generation", "text": "hi."}),
                    json!({"event_type": "stream-end", "finish_reason": "COMPLETE", "response": {}}),
                ]),
                "application/stream+json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ndjson(&[
                    json!({"event_type": "stream-start", "generation_id": "g1"}),
                    json!({"event_type": "tool-calls-generation", "text": "",
                           "tool_calls": [{"name": "echo", "parameters": {"text": "hi"}}]}),
                    json!({"event_type": "stream-end", "finish_reason": "COMPLETE", "response": {
                        "chat_history": [
                            {"role": "USER", "message": "Echo hi"},
                            {"role": "CHATBOT", "message": "", "tool_calls": [{"name": "echo", "parameters": {"text": "hi"}}]}
                        ]
                    }}),
                ]),
                "application/stream+json",
            ))
            .mount(&server)
            .await;

        let adapter: Arc<dyn VendorAdapter> = Arc::new(adapter(&server));
        let mut conv = Conversation::new();
        conv.push(Message::user("Echo hi"));
        let request = GenerationRequest::new(conv).tools(echo_registry().describe_all());
        let events: Vec<GenerationEvent> =
            run_generation(adapter, request, Some(ToolDispatcher::new(echo_registry())))
                .collect()
                .await;

        assert!(matches!(events.last(), Some(GenerationEvent::Done(o)) if o.text == "It said hi."));

        let requests = server.received_requests().await.unwrap();
        let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(second["message"], "");
        assert_eq!(second["chat_history"].as_array().unwrap().len(), 2);
        assert_eq!(second["tool_results"][0]["call"]["name"], "echo");
        assert_eq!(second["tool_results"][0]["outputs"][0]["output"], "hi");
    }
}
