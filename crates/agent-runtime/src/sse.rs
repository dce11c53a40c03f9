//! Stream framing
//!
//! Turns a chunked HTTP body into frames: Server-Sent Events (parsed by
//! `eventsource-stream`) or newline-delimited JSON. Chunk boundaries may
//! fall anywhere, including inside a multi-byte UTF-8 sequence.

use agent_core::{AgentError, Result};
use async_stream::stream;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

/// Upper bound on buffered, not yet framed body bytes
const MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Event type the SSE parser reports when a frame has no `event:` field
const DEFAULT_EVENT: &str = "message";

/// One Server-Sent Event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, when present
    pub event: Option<String>,

    /// `data:` lines joined by `\n`
    pub data: String,
}

/// Length of the longest prefix not ending inside a UTF-8 sequence
fn complete_prefix(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => bytes.len(),
    }
}

/// Re-chunk a body so every chunk ends on a character boundary
fn utf8_aligned<S, B, E>(body: S) -> impl Stream<Item = std::result::Result<Vec<u8>, E>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Send,
{
    stream! {
        futures::pin_mut!(body);
        let mut carry: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    carry.extend_from_slice(chunk.as_ref());
                    let tail = carry.split_off(complete_prefix(&carry));
                    let ready = std::mem::replace(&mut carry, tail);
                    if !ready.is_empty() {
                        yield Ok(ready);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if !carry.is_empty() {
            yield Ok(carry);
        }
    }
}

/// Decode a body as Server-Sent Events
pub fn sse_events<S, B, E>(body: S) -> BoxStream<'static, Result<SseEvent>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    utf8_aligned(body)
        .eventsource()
        .map(|event| match event {
            Ok(event) => Ok(SseEvent {
                event: (event.event != DEFAULT_EVENT).then_some(event.event),
                data: event.data,
            }),
            Err(EventStreamError::Transport(e)) => {
                Err(AgentError::ProviderUnavailable(format!("stream interrupted: {e}")))
            }
            Err(e) => Err(AgentError::Parse(format!("invalid event stream: {e}"))),
        })
        .boxed()
}

/// Incremental splitter of a byte stream into lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    bytes: Vec<u8>,
    text: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the non-blank lines it completed
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.bytes.extend_from_slice(chunk);
        self.decode_utf8();
        if self.text.len() + self.bytes.len() > MAX_BUFFER {
            return Err(AgentError::Parse(
                "stream line exceeds the buffer limit".into(),
            ));
        }

        let mut lines = Vec::new();
        while let Some(idx) = self.text.find('\n') {
            let line: String = self.text.drain(..=idx).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }

    /// Whatever is left once the body ends
    pub fn finish(mut self) -> Option<String> {
        if !self.bytes.is_empty() {
            self.text.push_str(&String::from_utf8_lossy(&self.bytes));
        }
        let rest = self.text.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn decode_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.bytes.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.bytes[..valid_up_to]) {
                        self.text.push_str(valid);
                    }
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.bytes.drain(..valid_up_to);
                            return;
                        }
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.bytes.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
    }
}

/// Decode a body as newline-delimited JSON
pub fn json_lines<S, B, E>(body: S) -> BoxStream<'static, Result<Value>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let lines = stream! {
        futures::pin_mut!(body);
        let mut decoder = LineDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(AgentError::ProviderUnavailable(format!("stream interrupted: {e}")));
                    return;
                }
            };
            match decoder.push(chunk.as_ref()) {
                Ok(done) => {
                    for line in done {
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            yield Ok(rest);
        }
    };
    lines
        .map(|line: Result<String>| {
            let line = line?;
            serde_json::from_str(&line)
                .map_err(|e| AgentError::Parse(format!("invalid JSON line: {e}")))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Vec<u8>, String>> {
        stream::iter(parts.into_iter().map(Ok))
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut decoder = LineDecoder::new();
        let bytes = "wörld\n".as_bytes();
        // 'ö' is two bytes; split between them
        assert!(decoder.push(&bytes[..2]).unwrap().is_empty());
        let lines = decoder.push(&bytes[2..]).unwrap();
        assert_eq!(lines, vec!["wörld".to_string()]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"{\"a\":1}\r\n\r\n{\"b\":2}\r\n").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[tokio::test]
    async fn test_sse_events_across_chunks() {
        let body = chunks(vec![
            b"event: ping\nda".to_vec(),
            b"ta: {}\n\n: comment\n\ndata: one\ndata: two\n\ndata: [DONE]".to_vec(),
            b"\n\n".to_vec(),
        ]);
        let events: Vec<_> = sse_events(body).map(|e| e.unwrap()).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "one\ntwo");
        assert_eq!(events[2].data, "[DONE]");
    }

    #[tokio::test]
    async fn test_sse_multibyte_split_across_chunks() {
        let frame = "data: {\"text\":\"olá\"}\n\n".as_bytes();
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let body = chunks(vec![frame[..split].to_vec(), frame[split..].to_vec()]);
        let events: Vec<_> = sse_events(body).map(|e| e.unwrap()).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"olá\"}");
    }

    #[tokio::test]
    async fn test_sse_transport_error() {
        let body = stream::iter(vec![
            Ok(b"data: a\n\n".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let events: Vec<_> = sse_events(body).collect().await;
        assert!(matches!(&events[0], Ok(e) if e.data == "a"));
        assert!(matches!(events[1], Err(AgentError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_json_lines_with_trailing_line() {
        let body = chunks(vec![
            b"{\"event_type\":\"text-generation\",\"text\":\"Hi\"}\n{\"event_type\":".to_vec(),
            b"\"stream-end\"}".to_vec(),
        ]);
        let values: Vec<_> = json_lines(body).map(|v| v.unwrap()).collect().await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["event_type"], "stream-end");
    }

    #[tokio::test]
    async fn test_invalid_json_line_is_parse_error() {
        let body = chunks(vec![b"not json\n".to_vec()]);
        let values: Vec<_> = json_lines(body).collect().await;
        assert!(matches!(values[0], Err(AgentError::Parse(_))));
    }
}
