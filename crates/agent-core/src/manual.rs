//! Manual Tool Protocol
//!
//! For models without structured tool calling. The system prompt teaches the
//! model to emit
//!
//! ```text
//! <function_calls><tool_name>NAME</tool_name><parameters><p1>v1</p1></parameters></function_calls>
//! ```
//!
//! and generation stops at [`STOP_SEQUENCE`]. The [`ToolInvocationLoop`] then
//! runs the tool and re-issues generation with the whole answer so far plus
//! the `<function_results>` envelope as the postpend.

use futures::StreamExt;
use futures::stream::BoxStream;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::generation::{
    FAILURE_SENTINEL, GenerationEvent, GenerationOutcome, TOOL_LOOP_LIMIT_SENTINEL,
    run_generation,
};
use crate::message::Conversation;
use crate::provider::{GenerationRequest, ToolCallRequest, VendorAdapter};
use crate::tool::{DispatchEvent, ResultMode, ToolDispatcher, ToolRegistry};

pub const OPEN_TAG: &str = "<function_calls>";

/// Stop sequence passed to every manual-mode generation
pub const STOP_SEQUENCE: &str = "</function_calls>";

/// Appended after each result to steer the next round
pub const SCRATCHPAD_CONTINUATION: &str = "<scratchpad> To answer the question, I still need to:";

/// Postpend reminding the model to stick to the tools it was given
pub const ANTI_HALLUCINATION_POSTPEND: &str = "<scratchpad> I can only use functions that have been explicitly provided. I must follow the <tool_guidelines></tool_guidelines>. I need the following tools:";

/// Tool name reported when a call body cannot be parsed
pub const UNKNOWN_TOOL: &str = "unknown";

/// A call parsed out of generated text
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedCall {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    /// Set when the body could not be parsed; `tool_name` is then `unknown`
    pub error: Option<String>,
}

impl ParsedCall {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            tool_name: UNKNOWN_TOOL.into(),
            parameters: Map::new(),
            error: Some(error.into()),
        }
    }
}

/// Body of the last `<function_calls>` block in `text`, if any
pub fn extract_call(text: &str) -> Option<&str> {
    let (_, after) = text.rsplit_once(OPEN_TAG)?;
    Some(after.split(STOP_SEQUENCE).next().unwrap_or(after))
}

/// Parse a call body. Never fails: malformed input yields an `unknown` call.
pub fn parse_call(body: &str) -> ParsedCall {
    if body.contains('&') {
        return ParsedCall::failed(
            "The character & is not allowed inside function calls. Rewrite the call without it.",
        );
    }
    let document = format!("{OPEN_TAG}{body}{STOP_SEQUENCE}");
    parse_document(&document).unwrap_or_else(ParsedCall::failed)
}

fn parse_document(document: &str) -> Result<ParsedCall, String> {
    let mut reader = Reader::from_str(document);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut tool_name = None;
    let mut parameters = Map::new();

    loop {
        match reader.read_event().map_err(|e| format!("Malformed function call: {e}"))? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                text.clear();
            }
            Event::Empty(e) => {
                if path.len() == 2 && path[1] == "parameters" {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    parameters.insert(name, Value::String(String::new()));
                }
            }
            Event::Text(t) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| format!("Malformed function call: {e}"))?;
                text.push_str(&unescaped);
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
            Event::End(_) => {
                let Some(name) = path.pop() else {
                    return Err("Malformed function call: unbalanced closing tag".into());
                };
                match (path.len(), path.last().map(String::as_str)) {
                    (1, _) if name == "tool_name" => tool_name = Some(text.trim().to_string()),
                    (2, Some("parameters")) => {
                        parameters.insert(name, Value::String(text.trim().to_string()));
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !path.is_empty() {
        return Err(format!("Malformed function call: unclosed <{}>", path.join("><")));
    }
    match tool_name {
        Some(tool_name) if !tool_name.is_empty() => Ok(ParsedCall {
            tool_name,
            parameters,
            error: None,
        }),
        _ => Err("Malformed function call: missing <tool_name>".into()),
    }
}

/// `<function_results>` envelope followed by the scratchpad continuation
pub fn wrap_result(tool_name: &str, result: &str) -> String {
    format!(
        "\n<function_results><result><tool_name>{tool_name}</tool_name><stdout>{result}</stdout></result></function_results>\n{SCRATCHPAD_CONTINUATION}"
    )
}

/// System prompt section teaching the call protocol and listing the tools
pub fn tool_prompt_section(registry: &ToolRegistry) -> String {
    format!(
        r"In this environment you have access to a set of tools you can use to answer the user's question.

You call a tool by writing:
<function_calls>
<tool_name>$TOOL_NAME</tool_name>
<parameters>
<$PARAMETER_NAME>$PARAMETER_VALUE</$PARAMETER_NAME>
...
</parameters>
</function_calls>

Stop writing right after </function_calls>. The result arrives as:
<function_results>
<result>
<tool_name>$TOOL_NAME</tool_name>
<stdout>$RESULT</stdout>
</result>
</function_results>

<tool_guidelines>
Only call the tools listed below, with the parameters they declare.
Call one tool at a time and wait for its result before calling another.
Never write the character & inside a function call.
If no tool is needed, answer directly.
</tool_guidelines>

Here are the tools available:
{}",
        registry.describe_xml()
    )
}

/// Manual-mode tool loop for one user turn
#[derive(Clone)]
pub struct ToolInvocationLoop {
    adapter: Arc<dyn VendorAdapter>,
    dispatcher: ToolDispatcher,
    max_rounds: usize,
}

impl ToolInvocationLoop {
    pub fn new(adapter: Arc<dyn VendorAdapter>, dispatcher: ToolDispatcher) -> Self {
        Self {
            adapter,
            dispatcher,
            max_rounds: 10,
        }
    }

    #[must_use]
    pub const fn max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Run the loop.
    ///
    /// Yields the same events as [`run_generation`]; the concatenated
    /// deltas reproduce the final answer, tool results included.
    pub fn run(
        self,
        messages: Conversation,
        postpend: Option<String>,
    ) -> BoxStream<'static, GenerationEvent> {
        Box::pin(async_stream::stream! {
            let mut cur_postpend = postpend
                .filter(|_| self.adapter.info().supports_prefill)
                .unwrap_or_default();
            if !cur_postpend.is_empty() {
                yield GenerationEvent::Delta(cur_postpend.clone());
            }
            let mut rounds = 0usize;

            loop {
                let request = GenerationRequest::new(messages.clone())
                    .postpend(cur_postpend.clone())
                    .stop_sequence(STOP_SEQUENCE);

                let mut events = run_generation(Arc::clone(&self.adapter), request, None);
                let mut outcome = None;
                while let Some(event) = events.next().await {
                    match event {
                        GenerationEvent::Done(done) => outcome = Some(done),
                        GenerationEvent::Failed(sentinel) => {
                            yield GenerationEvent::Failed(sentinel);
                            return;
                        }
                        other => yield other,
                    }
                }
                let Some(outcome) = outcome else {
                    yield GenerationEvent::Failed(FAILURE_SENTINEL.into());
                    return;
                };

                let cur_answer = outcome.text;
                let continuation = cur_answer
                    .strip_prefix(cur_postpend.as_str())
                    .unwrap_or(&cur_answer);

                let Some(body) = extract_call(continuation) else {
                    yield GenerationEvent::Done(GenerationOutcome {
                        text: cur_answer,
                        exchange_messages: Vec::new(),
                        stop_reason: outcome.stop_reason,
                    });
                    return;
                };

                rounds += 1;
                if rounds > self.max_rounds {
                    warn!(rounds, "Manual tool loop limit reached");
                    let tail = format!("\n{TOOL_LOOP_LIMIT_SENTINEL}");
                    yield GenerationEvent::Delta(tail.clone());
                    yield GenerationEvent::Done(GenerationOutcome {
                        text: format!("{cur_answer}{tail}"),
                        exchange_messages: Vec::new(),
                        stop_reason: outcome.stop_reason,
                    });
                    return;
                }

                let call = parse_call(body);
                debug!(tool = %call.tool_name, round = rounds, "Manual tool call");
                if let Some(error) = &call.error {
                    warn!(%error, "Unparseable function call");
                }
                yield GenerationEvent::ToolCall(ToolCallRequest {
                    id: format!("manual_{rounds}"),
                    name: call.tool_name.clone(),
                    arguments: call.parameters.clone(),
                });

                let mode = if call.error.is_some() {
                    ResultMode::ResultsOnly
                } else {
                    ResultMode::Wrapped
                };
                let mut dispatch = self
                    .dispatcher
                    .invoke_stream(&call.tool_name, call.parameters.clone(), mode);
                let mut result = String::new();
                while let Some(event) = dispatch.next().await {
                    match event {
                        DispatchEvent::Progress(value) => {
                            yield GenerationEvent::ToolProgress { name: call.tool_name.clone(), value };
                        }
                        DispatchEvent::Result(text) => result = text,
                    }
                }
                if let Some(error) = &call.error {
                    result = wrap_result(&call.tool_name, &format!("{error}\n{result}"));
                }

                yield GenerationEvent::ToolResult {
                    call_id: format!("manual_{rounds}"),
                    name: call.tool_name.clone(),
                    result: result.clone(),
                };
                yield GenerationEvent::Delta(result.clone());
                cur_postpend = format!("{cur_answer}{result}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::provider::VendorEvent;
    use crate::testing::{ScriptedAdapter, echo_registry};

    #[test]
    fn test_extract_takes_last_call() {
        let text = "a <function_calls>old</function_calls> b <function_calls><tool_name>x</tool_name></function_calls>";
        assert_eq!(extract_call(text), Some("<tool_name>x</tool_name>"));
        assert_eq!(extract_call("no calls here"), None);
    }

    #[test]
    fn test_parse_well_formed_call() {
        let call = parse_call(
            "<tool_name>do_date_math</tool_name><parameters><base_date>2024-10-01</base_date><deltas>1</deltas><delta_type>day</delta_type></parameters>",
        );
        assert_eq!(call.tool_name, "do_date_math");
        assert_eq!(call.parameters["deltas"], Value::String("1".into()));
        assert_eq!(call.parameters.len(), 3);
        assert!(call.error.is_none());
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        let call = parse_call("\n<tool_name>\n  echo\n</tool_name>\n<parameters>\n<text>\nhi\n</text>\n</parameters>\n");
        assert_eq!(call.tool_name, "echo");
        assert_eq!(call.parameters["text"], Value::String("hi".into()));
    }

    #[test]
    fn test_parse_failures_are_recovered() {
        for body in [
            "<tool_name>search</tool_name><parameters><q>fish & chips</q></parameters>",
            "<tool_name>search</tool_name><parameters><q>open",
            "<parameters><q>x</q></parameters>",
            "<tool_name>a</b>",
        ] {
            let call = parse_call(body);
            assert_eq!(call.tool_name, UNKNOWN_TOOL, "body: {body}");
            assert!(call.parameters.is_empty());
            assert!(call.error.as_deref().is_some_and(|e| !e.is_empty()));
        }
    }

    #[test]
    fn test_wrap_result_envelope() {
        assert_eq!(
            wrap_result("do_date_math", "2024-10-02 Wednesday"),
            "\n<function_results><result><tool_name>do_date_math</tool_name><stdout>2024-10-02 Wednesday</stdout></result></function_results>\n<scratchpad> To answer the question, I still need to:"
        );
    }

    #[test]
    fn test_prompt_section_lists_tools() {
        let section = tool_prompt_section(&echo_registry());
        assert!(section.contains("<tool_guidelines>"));
        assert!(section.contains("<tool_name>echo</tool_name>"));
    }

    fn conversation() -> Conversation {
        Conversation::from_messages(vec![Message::user("say pong")])
    }

    #[tokio::test]
    async fn test_loop_runs_tool_and_reissues() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .round(vec![
                    VendorEvent::TextDelta("I will echo. <function_calls><tool_name>echo</tool_name>".into()),
                    VendorEvent::TextDelta("<parameters><text>pong</text></parameters>".into()),
                    VendorEvent::Stop {
                        reason: Some("stop_sequence".into()),
                        stop_sequence: Some(STOP_SEQUENCE.into()),
                    },
                ])
                .round(vec![VendorEvent::TextDelta(" The tool said pong.".into())]),
        );
        let dispatcher = ToolDispatcher::new(echo_registry());
        let events: Vec<_> = ToolInvocationLoop::new(adapter.clone(), dispatcher.clone())
            .run(conversation(), None)
            .collect()
            .await;

        let Some(GenerationEvent::Done(outcome)) = events.last() else {
            panic!("expected Done, got {events:?}");
        };
        let envelope = wrap_result("echo", "pong");
        assert!(outcome.text.contains(&envelope));
        assert!(outcome.text.ends_with(" The tool said pong."));

        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, outcome.text);

        let bodies = adapter.sent_bodies();
        assert_eq!(bodies.len(), 2);
        let second_postpend = bodies[1]["postpend"].as_str().unwrap();
        assert!(second_postpend.ends_with(&envelope));
        assert_eq!(bodies[1]["stop_sequences"][0], STOP_SEQUENCE);
        assert_eq!(dispatcher.log().take().len(), 1);
    }

    #[tokio::test]
    async fn test_previous_call_not_retriggered() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .round(vec![VendorEvent::TextDelta(
                    "<function_calls><tool_name>echo</tool_name><parameters><text>a</text></parameters></function_calls>".into(),
                )])
                .round(vec![VendorEvent::TextDelta("Done.".into())]),
        );
        let events: Vec<_> = ToolInvocationLoop::new(adapter.clone(), ToolDispatcher::new(echo_registry()))
            .run(conversation(), None)
            .collect()
            .await;

        let calls = events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::ToolCall(_)))
            .count();
        assert_eq!(calls, 1);
        assert_eq!(adapter.sent_bodies().len(), 2);
    }

    #[tokio::test]
    async fn test_round_cap_appends_sentinel() {
        let call = "<function_calls><tool_name>echo</tool_name><parameters><text>again</text></parameters></function_calls>";
        let mut scripted = ScriptedAdapter::new();
        for _ in 0..4 {
            scripted = scripted.round(vec![VendorEvent::TextDelta(call.into())]);
        }
        let events: Vec<_> = ToolInvocationLoop::new(Arc::new(scripted), ToolDispatcher::new(echo_registry()))
            .max_rounds(2)
            .run(conversation(), None)
            .collect()
            .await;

        let Some(GenerationEvent::Done(outcome)) = events.last() else {
            panic!("expected Done");
        };
        assert!(outcome.text.ends_with(TOOL_LOOP_LIMIT_SENTINEL));
    }

    #[tokio::test]
    async fn test_malformed_call_reports_unknown_tool() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .round(vec![VendorEvent::TextDelta(
                    "<function_calls><tool_name>echo</tool_name><parameters><text>a & b</text></parameters></function_calls>".into(),
                )])
                .round(vec![VendorEvent::TextDelta("Sorry.".into())]),
        );
        let events: Vec<_> = ToolInvocationLoop::new(adapter, ToolDispatcher::new(echo_registry()))
            .run(conversation(), Some(ANTI_HALLUCINATION_POSTPEND.into()))
            .collect()
            .await;

        let result = events
            .iter()
            .find_map(|e| match e {
                GenerationEvent::ToolResult { name, result, .. } => Some((name.clone(), result.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.0, UNKNOWN_TOOL);
        assert!(result.1.contains("not found"));
        assert!(result.1.contains("&"));
    }

    fn streamed_text(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_initial_postpend_is_streamed() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .round(vec![VendorEvent::TextDelta(
                    " echo</scratchpad><function_calls><tool_name>echo</tool_name><parameters><text>pong</text></parameters>".into(),
                )])
                .round(vec![VendorEvent::TextDelta(" It said pong.".into())]),
        );
        let events: Vec<_> = ToolInvocationLoop::new(adapter, ToolDispatcher::new(echo_registry()))
            .run(conversation(), Some(ANTI_HALLUCINATION_POSTPEND.into()))
            .collect()
            .await;

        let Some(GenerationEvent::Done(outcome)) = events.last() else {
            panic!("expected Done");
        };
        assert!(outcome.text.starts_with(ANTI_HALLUCINATION_POSTPEND));
        assert_eq!(streamed_text(&events), outcome.text);
    }

    #[tokio::test]
    async fn test_postpend_skipped_without_prefill() {
        let adapter = Arc::new(
            ScriptedAdapter::new()
                .no_prefill()
                .round(vec![VendorEvent::TextDelta("Hello.".into())]),
        );
        let events: Vec<_> = ToolInvocationLoop::new(adapter.clone(), ToolDispatcher::new(echo_registry()))
            .run(conversation(), Some(ANTI_HALLUCINATION_POSTPEND.into()))
            .collect()
            .await;

        let Some(GenerationEvent::Done(outcome)) = events.last() else {
            panic!("expected Done");
        };
        assert_eq!(outcome.text, "Hello.");
        assert_eq!(streamed_text(&events), "Hello.");
        assert!(adapter.sent_bodies()[0]["postpend"].is_null());
    }
}
