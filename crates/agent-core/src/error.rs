//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Non-success HTTP status from a vendor endpoint
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments did not match the tool schema
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Message sequence is not acceptable for a generation request
    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    /// Parse error (stream payloads, tool call bodies)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Whether the error happened at the transport boundary.
    ///
    /// Transport errors are retried by the generation loop; everything else
    /// fails the round immediately.
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Provider(_)
                | Self::ProviderUnavailable(_)
                | Self::Http { .. }
                | Self::RateLimited(_)
                | Self::Auth(_)
                | Self::Parse(_)
                | Self::Io(_)
                | Self::Json(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) | Self::Http { .. } => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolValidation(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::InvalidConversation(msg) => format!("The conversation cannot be sent: {msg}"),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(AgentError::Provider("reset".into()).is_transport());
        assert!(!AgentError::InvalidConversation("empty".into()).is_transport());
        assert!(!AgentError::ToolNotFound("x".into()).is_transport());
        assert!(AgentError::Http { status: 503, message: "busy".into() }.is_transport());
        assert!(!AgentError::Config("x".into()).is_transport());
    }
}
