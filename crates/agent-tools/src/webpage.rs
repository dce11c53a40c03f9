//! Webpage Tool
//!
//! Fetches one or more URLs and returns their visible text plus the links
//! found on the page.

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use agent_core::{
    AgentError, ParamType, ParameterSchema, Result, Tool, ToolArgs, ToolDescriptor, ToolOutput,
};

/// Page text beyond this many characters is cut
pub const DEFAULT_MAX_CHARS: usize = 20_000;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_10_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/39.0.2171.95 Safari/537.36";

const DESCRIPTION: &str = "Retrieves the contents of one or more internet URLs, separated by commas. Use this tool when the user requests you to read a webpage, or find something on the internet. Returns the visible text of each page and the list of links it contains.";

static HIDDEN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "style", "head", "noscript", "svg"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b.*?</{tag}\s*>")).unwrap())
        .chain(std::iter::once(Regex::new(r"(?s)<!--.*?-->").unwrap()))
        .collect()
});
static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#).unwrap()
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn visible_text(html: &str) -> String {
    let text = TAG.replace_all(html, " ");
    let text = decode_entities(&text);
    SPACE.replace_all(&text, " ").trim().to_string()
}

/// Visible text and `[ href ] label` link lines of an HTML document
pub fn text_and_links(html: &str) -> (String, String) {
    let mut cleaned = html.to_string();
    for pattern in HIDDEN.iter() {
        cleaned = pattern.replace_all(&cleaned, " ").into_owned();
    }

    let links = LINK
        .captures_iter(&cleaned)
        .map(|c| format!("[ {} ] {}", c[1].trim(), visible_text(&c[2])))
        .collect::<Vec<_>>()
        .join("\n");

    (visible_text(&cleaned), links)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

/// `get_webpage_contents` tool
pub struct WebpageTool {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
    max_chars: usize,
}

impl WebpageTool {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;

        let descriptor = ToolDescriptor::new("get_webpage_contents", DESCRIPTION).param(
            ParameterSchema::required(
                "url",
                ParamType::String,
                "Website URLs separated by commas, e.g. http://www.g1.com, https://www.walljournal.com",
            ),
        );
        Ok(Self {
            descriptor,
            client,
            max_chars: DEFAULT_MAX_CHARS,
        })
    }

    #[must_use]
    pub const fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

async fn fetch(client: &reqwest::Client, url: &str, max_chars: usize) -> String {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(%url, error = %e, "Could not fetch page");
            return format!("Could not retrieve page from URL {url}.\nError description: {e}");
        }
    };

    let status = response.status().as_u16();
    let source = response.url().to_string();
    match response.text().await {
        Ok(html) => {
            let (text, links) = text_and_links(&html);
            debug!(%url, status, chars = text.len(), "Fetched page");
            format!(
                "<source_url>{source}</source_url><status_code>{status}</status_code>\n<contents>{}</contents><urls>{links}</urls>",
                truncate(&text, max_chars)
            )
        }
        Err(e) => format!("Could not retrieve page from URL {url}.\nError description: {e}"),
    }
}

#[async_trait]
impl Tool for WebpageTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput> {
        let urls: Vec<String> = args
            .str("url")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
        let client = self.client.clone();
        let max_chars = self.max_chars;

        let values = async_stream::stream! {
            let mut document = Vec::with_capacity(urls.len());
            for url in urls {
                yield format!("<scratchpad>Reading {url}</scratchpad>");
                let content = fetch(&client, &url, max_chars).await;
                let mut block = String::new();
                let _ = write!(
                    block,
                    "<url_content>\n<url>{url}</url>\n<content>{content}</content>\n</url_content>"
                );
                document.push(block);
            }
            yield document.join("\n");
        };
        Ok(ToolOutput::Stream(values.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::tool::{DispatchEvent, ResultMode};
    use agent_core::{ToolDispatcher, ToolRegistry};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html><head><title>Ignored</title><style>p { color: red }</style></head>
<body><!-- hidden --><script>var x = 1;</script>
<h1>News &amp; Views</h1>
<p>First <b>story</b>.</p>
<a href="/economy/1">Markets  rally</a>
</body></html>"#;

    #[test]
    fn test_text_and_links() {
        let (text, links) = text_and_links(PAGE);
        assert_eq!(text, "News & Views First story . Markets rally");
        assert_eq!(links, "[ /economy/1 ] Markets rally");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé... [truncated]");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[tokio::test]
    async fn test_streams_progress_then_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let mut registry = ToolRegistry::new();
        registry.register(WebpageTool::new().unwrap().with_max_chars(4));
        let url = format!("{}/news", server.uri());

        let events: Vec<DispatchEvent> = ToolDispatcher::new(registry)
            .invoke_stream(
                "get_webpage_contents",
                json!({"url": url}).as_object().cloned().unwrap(),
                ResultMode::ResultsOnly,
            )
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], DispatchEvent::Progress(p) if p.contains("Reading")));
        let DispatchEvent::Result(result) = &events[2] else {
            panic!("missing result");
        };
        assert!(result.starts_with(&format!("<url_content>\n<url>{url}</url>")));
        assert!(result.contains("<status_code>200</status_code>"));
        assert!(result.contains("<contents>News... [truncated]</contents>"));
        assert!(result.contains("[ /economy/1 ] Markets rally"));
    }

    #[tokio::test]
    async fn test_unreachable_url_is_reported_as_text() {
        let tool = WebpageTool::new().unwrap();
        let content = fetch(&tool.client, "http://127.0.0.1:9/nothing", 100).await;
        assert!(content.starts_with("Could not retrieve page from URL http://127.0.0.1:9/nothing."));
    }
}
