//! Generation Loop
//!
//! Drives one generation against a [`VendorAdapter`]:
//!
//! ```text
//! Idle -> Sent -> Streaming -> Done
//!                    |    \--> Failed (retry budget exhausted)
//!                    v
//!               ToolPending -> ReIssue -> Sent ...
//! ```
//!
//! Native tool rounds are fully internal: the caller sees deltas, tool
//! activity and a single [`GenerationEvent::Done`]. Transport failures are
//! retried with backoff and surfaced as [`GenerationEvent::Retry`]; an
//! exhausted budget ends the stream with [`GenerationEvent::Failed`] carrying
//! [`FAILURE_SENTINEL`].

use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::message::{Content, ContentBlock, Message, Role};
use crate::provider::{
    GenerationRequest, RoundOutcome, StreamAccumulator, ToolCallRequest, ToolExchange,
    VendorAdapter,
};
use crate::tool::{DispatchEvent, ResultMode, ToolDispatcher};

/// Text yielded when the model could not be reached
pub const FAILURE_SENTINEL: &str = "Could not invoke the AI model.";

/// Appended to the answer when a turn needs too many tool rounds
pub const TOOL_LOOP_LIMIT_SENTINEL: &str = "Tool loop limit exceeded.";

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").unwrap());

/// Approximate word count used for usage bookkeeping
pub fn count_words(text: &str) -> usize {
    WORD.find_iter(text).count()
}

/// Side-channel bookkeeping for one completed round
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_word_count: usize,
    pub answer_word_count: usize,
    pub price_estimate: f64,
    pub exec_time: Duration,
}

/// Result of a completed generation
#[derive(Clone, Debug, Default)]
pub struct GenerationOutcome {
    /// Postpend (when still in effect) plus the final round's text
    pub text: String,

    /// Canonical assistant/tool message pairs produced by native tool rounds
    pub exchange_messages: Vec<Message>,

    pub stop_reason: Option<String>,
}

/// Event yielded by [`run_generation`]
#[derive(Clone, Debug)]
pub enum GenerationEvent {
    /// Visible text
    Delta(String),
    /// A native tool call is about to run
    ToolCall(ToolCallRequest),
    /// Intermediate output of a streaming tool
    ToolProgress { name: String, value: String },
    /// A native tool call finished
    ToolResult {
        call_id: String,
        name: String,
        result: String,
    },
    /// A transport failure will be retried; text of the current round is void
    Retry {
        message: String,
        attempt: u32,
        max_retries: u32,
    },
    /// Bookkeeping for a completed round
    Usage(UsageRecord),
    /// Terminal failure; carries [`FAILURE_SENTINEL`]
    Failed(String),
    /// Terminal success
    Done(GenerationOutcome),
}

/// Run a generation, executing native tool calls through `dispatcher`.
///
/// Without a dispatcher (or for adapters without tool support) the first
/// completed round ends the generation even if it requested tools.
pub fn run_generation(
    adapter: Arc<dyn VendorAdapter>,
    mut request: GenerationRequest,
    dispatcher: Option<ToolDispatcher>,
) -> BoxStream<'static, GenerationEvent> {
    Box::pin(async_stream::stream! {
        let info = adapter.info().clone();
        let max_retries = info.retry.max_retries.max(1);
        if !info.supports_prefill && request.postpend.take().is_some() {
            debug!(adapter = %info.name, "No assistant prefill; postpend dropped");
        }

        let mut body = match adapter.build_request(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!(adapter = %info.name, error = %e, "Could not build request");
                yield GenerationEvent::Failed(FAILURE_SENTINEL.into());
                return;
            }
        };

        let mut postpend = request.postpend.clone().unwrap_or_default();
        let mut exchange_messages = Vec::new();
        let mut tool_rounds = 0usize;
        let mut failures = 0u32;
        let mut delay = info.retry.base_delay;

        loop {
            let started = Instant::now();
            let request_words = count_words(&body_text(&body));
            debug!("Invoking {}. Word count: {}", info.name, request_words);

            let mut acc = StreamAccumulator::new(request.stop_sequences.clone());
            let mut error = None;
            match adapter.open_stream(&body).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        match event.and_then(|ev| acc.apply(ev)) {
                            Ok(Some(delta)) => yield GenerationEvent::Delta(delta),
                            Ok(None) => {}
                            Err(e) => {
                                error = Some(e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => error = Some(e),
            }

            let round = match error {
                None => acc.finish(),
                Some(e) => Err(e),
            };
            let round = match round {
                Ok(round) => round,
                Err(e) => {
                    failures += 1;
                    if !e.is_transport() || failures >= max_retries {
                        warn!(
                            adapter = %info.name,
                            error = %e,
                            attempt = failures,
                            max_retries,
                            "Giving up on generation"
                        );
                        yield GenerationEvent::Failed(FAILURE_SENTINEL.into());
                        return;
                    }
                    let message = format!(
                        "Error {e}. Waiting {} s. Retrying {failures}/{max_retries}...",
                        delay.as_secs()
                    );
                    warn!(adapter = %info.name, attempt = failures, max_retries, "{message}");
                    yield GenerationEvent::Retry {
                        message,
                        attempt: failures,
                        max_retries,
                    };
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(info.retry.multiplier);
                    continue;
                }
            };

            let answer_words = count_words(&round.text);
            yield GenerationEvent::Usage(UsageRecord {
                request_word_count: request_words,
                answer_word_count: answer_words,
                price_estimate: info.pricing.estimate(request_words, answer_words),
                exec_time: started.elapsed(),
            });

            let calls = adapter.detect_tool_call(&round);
            let dispatcher = match &dispatcher {
                Some(d) if info.supports_tools && !calls.is_empty() => d,
                _ => {
                    yield GenerationEvent::Done(GenerationOutcome {
                        text: format!("{postpend}{}", round.text),
                        exchange_messages,
                        stop_reason: round.stop_reason,
                    });
                    return;
                }
            };

            tool_rounds += 1;
            if tool_rounds > request.max_tool_rounds {
                warn!(adapter = %info.name, rounds = tool_rounds, "Tool round limit reached");
                yield GenerationEvent::Done(GenerationOutcome {
                    text: format!("{postpend}{}\n{TOOL_LOOP_LIMIT_SENTINEL}", round.text),
                    exchange_messages,
                    stop_reason: round.stop_reason,
                });
                return;
            }

            let mut exchanges = Vec::with_capacity(calls.len());
            for call in calls {
                yield GenerationEvent::ToolCall(call.clone());
                let mut events =
                    dispatcher.invoke_stream(&call.name, call.arguments.clone(), ResultMode::ResultsOnly);
                let mut result = String::new();
                while let Some(event) = events.next().await {
                    match event {
                        DispatchEvent::Progress(value) => {
                            yield GenerationEvent::ToolProgress { name: call.name.clone(), value };
                        }
                        DispatchEvent::Result(text) => result = text,
                    }
                }
                yield GenerationEvent::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: result.clone(),
                };
                exchanges.push(ToolExchange { call, result });
            }

            let round = RoundOutcome {
                text: format!("{postpend}{}", round.text),
                ..round
            };
            if let Err(e) = adapter.reconcile_tool_results(&mut body, &round, &exchanges) {
                warn!(adapter = %info.name, error = %e, "Could not append tool results");
                yield GenerationEvent::Failed(FAILURE_SENTINEL.into());
                return;
            }
            exchange_messages.extend(canonical_exchange(&round.text, &exchanges));
            postpend.clear();
        }
    })
}

/// Canonical assistant tool-call message followed by one tool-result message
pub fn canonical_exchange(text: &str, exchanges: &[ToolExchange]) -> Vec<Message> {
    let mut call_blocks = Vec::with_capacity(exchanges.len() + 1);
    if !text.is_empty() {
        call_blocks.push(ContentBlock::Text { text: text.to_string() });
    }
    call_blocks.extend(exchanges.iter().map(|ex| ContentBlock::ToolCall {
        id: ex.call.id.clone(),
        name: ex.call.name.clone(),
        arguments: ex.call.arguments.clone(),
    }));

    let result_blocks = exchanges
        .iter()
        .map(|ex| ContentBlock::ToolResult {
            call_id: ex.call.id.clone(),
            name: ex.call.name.clone(),
            content: ex.result.clone(),
        })
        .collect();

    vec![
        Message::new(Role::Assistant, Content::Blocks(call_blocks)),
        Message::new(Role::Tool, Content::Blocks(result_blocks)),
    ]
}

/// Text content of a request body, for word counting
fn body_text(body: &Value) -> String {
    fn walk(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                out.push_str(s);
                out.push(' ');
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = String::new();
    walk(body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Conversation;
    use crate::provider::VendorEvent;
    use crate::testing::{ScriptedAdapter, echo_registry};
    use serde_json::json;

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest::new(Conversation::from_messages(vec![Message::user(text)]))
    }

    async fn collect(stream: BoxStream<'static, GenerationEvent>) -> Vec<GenerationEvent> {
        stream.collect().await
    }

    fn done(events: &[GenerationEvent]) -> Option<&GenerationOutcome> {
        events.iter().find_map(|e| match e {
            GenerationEvent::Done(outcome) => Some(outcome),
            _ => None,
        })
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words("What day will it be 10 days from today?"), 9);
        assert_eq!(count_words(""), 0);
    }

    #[tokio::test]
    async fn test_text_only_generation() {
        let adapter = ScriptedAdapter::new().round(vec![
            VendorEvent::TextDelta("Hello".into()),
            VendorEvent::TextDelta(" there".into()),
        ]);
        let events = collect(run_generation(Arc::new(adapter), request("hi"), None)).await;

        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "Hello there");
        assert_eq!(done(&events).map(|o| o.text.as_str()), Some("Hello there"));
        assert!(events.iter().any(|e| matches!(e, GenerationEvent::Usage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let adapter = ScriptedAdapter::new()
            .fail_times(2)
            .round(vec![VendorEvent::TextDelta("ok".into())]);
        let events = collect(run_generation(Arc::new(adapter), request("hi"), None)).await;

        let retries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Retry { message, attempt, .. } => Some((message.clone(), *attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(retries.len(), 2);
        assert!(retries[0].0.starts_with("Error "));
        assert!(retries[0].0.contains("Waiting 6 s. Retrying 1/5..."));
        assert_eq!(done(&events).map(|o| o.text.as_str()), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_sentinel() {
        let adapter = ScriptedAdapter::new()
            .fail_times(5)
            .round(vec![VendorEvent::TextDelta("never".into())]);
        let events = collect(run_generation(Arc::new(adapter), request("hi"), None)).await;

        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Failed(text)) if text == FAILURE_SENTINEL
        ));
        assert!(done(&events).is_none());
    }

    #[tokio::test]
    async fn test_invalid_conversation_fails_without_retry() {
        let adapter = ScriptedAdapter::new().round(vec![VendorEvent::TextDelta("x".into())]);
        let req = GenerationRequest::new(Conversation::from_messages(vec![Message::assistant("hi")]));
        let events = collect(run_generation(Arc::new(adapter), req, None)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GenerationEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_native_tool_round_pairs_results() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .tools_supported()
                .round(vec![
                    VendorEvent::TextDelta("Let me echo.".into()),
                    VendorEvent::ToolCallStart { id: "call_1".into(), name: "echo".into() },
                    VendorEvent::ToolCallArgsDelta(r#"{"text":"pong"}"#.into()),
                    VendorEvent::ToolCallEnd,
                ])
                .round(vec![VendorEvent::TextDelta("It said pong.".into())]),
        );
        let dispatcher = ToolDispatcher::new(echo_registry());
        let events = collect(run_generation(
            Arc::clone(&adapter) as Arc<dyn VendorAdapter>,
            request("echo pong"),
            Some(dispatcher.clone()),
        ))
        .await;

        let outcome = done(&events).unwrap();
        assert_eq!(outcome.text, "It said pong.");
        assert_eq!(outcome.exchange_messages.len(), 2);
        assert_eq!(outcome.exchange_messages[1].role, Role::Tool);

        let bodies = adapter.sent_bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(
            bodies[1]["tool_results"],
            json!([{ "call_id": "call_1", "content": "pong" }])
        );
        assert_eq!(dispatcher.log().take().len(), 1);
    }

    #[tokio::test]
    async fn test_native_round_cap() {
        let mut adapter = ScriptedAdapter::new().tools_supported();
        for i in 0..5 {
            adapter = adapter.round(vec![VendorEvent::ToolCallComplete(ToolCallRequest {
                id: format!("c{i}"),
                name: "echo".into(),
                arguments: serde_json::from_value(json!({"text": "again"})).unwrap(),
            })]);
        }
        let req = request("loop").max_tool_rounds(2);
        let events = collect(run_generation(
            Arc::new(adapter),
            req,
            Some(ToolDispatcher::new(echo_registry())),
        ))
        .await;

        let outcome = done(&events).unwrap();
        assert!(outcome.text.ends_with(TOOL_LOOP_LIMIT_SENTINEL));
        let calls = events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::ToolCall(_)))
            .count();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_postpend_prefixes_text() {
        let adapter = ScriptedAdapter::new().round(vec![VendorEvent::TextDelta(" continued".into())]);
        let req = request("go").postpend("<scratchpad> I began");
        let events = collect(run_generation(Arc::new(adapter), req, None)).await;
        assert_eq!(
            done(&events).map(|o| o.text.as_str()),
            Some("<scratchpad> I began continued")
        );
    }

    #[tokio::test]
    async fn test_postpend_dropped_without_prefill() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .no_prefill()
                .round(vec![VendorEvent::TextDelta("Plain answer.".into())]),
        );
        let req = request("go").postpend("<scratchpad> I began");
        let events = collect(run_generation(
            Arc::clone(&adapter) as Arc<dyn VendorAdapter>,
            req,
            None,
        ))
        .await;
        assert_eq!(done(&events).map(|o| o.text.as_str()), Some("Plain answer."));
        assert!(adapter.sent_bodies()[0]["postpend"].is_null());
    }
}
