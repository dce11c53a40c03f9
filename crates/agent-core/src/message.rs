//! Conversation Messages
//!
//! Canonical message format used across the agent system. Vendor adapters
//! translate these into their own wire shapes and back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl Role {
    /// Side of the conversation for alternation checks.
    ///
    /// Tool results travel on the user side for vendors that require
    /// strict user/assistant alternation.
    pub const fn side(self) -> Self {
        match self {
            Self::Tool => Self::User,
            other => other,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Typed content block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64-encoded image
    Image {
        media_type: String,
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

/// Message content: plain text or an ordered list of blocks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Content as a block list (plain text becomes a single text block)
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text or block content
    pub content: Content,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a user message carrying base64 JPEG images followed by text
    pub fn user_with_images(text: impl Into<String>, images: &[String]) -> Self {
        if images.is_empty() {
            return Self::user(text.into());
        }
        let mut blocks: Vec<ContentBlock> = images
            .iter()
            .map(|data| ContentBlock::Image {
                media_type: "image/jpeg".into(),
                data: data.clone(),
            })
            .collect();
        blocks.push(ContentBlock::Text { text: text.into() });
        Self::user(Content::Blocks(blocks))
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message
    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            Role::Tool,
            Content::Blocks(vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                name: name.into(),
                content: content.into(),
            }]),
        )
    }

    /// Plain text of the message
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Tool call blocks carried by this message
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Map<String, Value>)> {
        let blocks: &[ContentBlock] = match &self.content {
            Content::Blocks(blocks) => blocks,
            Content::Text(_) => &[],
        };
        blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolCall { id, name, arguments } => {
                Some((id.as_str(), name.as_str(), arguments))
            }
            _ => None,
        })
    }
}

/// Conversation history with utility methods
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<Content>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt));
        conv
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// System prompt, if the first message carries one
    pub fn system_prompt(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    /// Messages after the system prompt
    pub fn turns(&self) -> &[Message] {
        match self.system_prompt() {
            Some(_) => &self.messages[1..],
            None => &self.messages,
        }
    }

    /// Check that the sequence may be sent for generation.
    ///
    /// At most one system message, only at index 0; the final message must
    /// be a user message. With `strict_alternation`, consecutive messages
    /// must sit on different sides (tool results count as the user side).
    pub fn validate(&self, strict_alternation: bool) -> Result<()> {
        for (idx, msg) in self.messages.iter().enumerate() {
            if msg.role == Role::System && idx != 0 {
                return Err(AgentError::InvalidConversation(format!(
                    "system message at position {idx}; only the first message may be a system prompt"
                )));
            }
        }

        match self.last() {
            Some(last) if last.role == Role::User => {}
            Some(last) => {
                return Err(AgentError::InvalidConversation(format!(
                    "conversation must end on a user message, found {}",
                    last.role
                )));
            }
            None => return Err(AgentError::InvalidConversation("no messages".into())),
        }

        if strict_alternation {
            for pair in self.turns().windows(2) {
                if pair[0].role.side() == pair[1].role.side() {
                    return Err(AgentError::InvalidConversation(format!(
                        "consecutive {} messages; roles must alternate",
                        pair[1].role.side()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
