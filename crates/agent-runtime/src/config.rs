//! Runtime Configuration
//!
//! Everything is read from the environment (after `.env` has been loaded by
//! the binary). Missing keys only matter when an adapter that needs them is
//! constructed.

use agent_core::{AgentError, Result, RetryPolicy, ToolMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_GROK_URL: &str = "https://api.x.ai/v1";
pub const DEFAULT_MARITACA_URL: &str = "https://chat.maritaca.ai/api";
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
pub const DEFAULT_VLLM_HOST: &str = "http://localhost:8000";
pub const DEFAULT_COHERE_URL: &str = "https://api.cohere.com";
pub const DEFAULT_BEDROCK_OPENAI_URL: &str = "https://bedrock-runtime.us-west-2.amazonaws.com/openai/v1";
pub const DEFAULT_MODEL: &str = "Claude 4.5 Sonnet - Anthropic";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Process-wide configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub grok_api_key: Option<String>,
    pub maritaca_api_key: Option<String>,
    pub cohere_api_key: Option<String>,
    pub bedrock_api_key: Option<String>,

    pub anthropic_base_url: String,
    pub openai_base_url: String,
    pub grok_base_url: String,
    pub maritaca_base_url: String,
    pub ollama_host: String,
    pub vllm_host: String,
    pub cohere_base_url: String,
    pub bedrock_openai_url: String,

    /// Folder for session logs; `None` disables persistence
    pub chat_log_dir: Option<PathBuf>,

    pub tool_mode: ToolMode,

    pub max_tool_rounds: usize,

    /// Catalogue key used when a request names no model
    pub default_model: String,

    /// Per-request timeout for vendor calls
    #[serde(with = "secs")]
    pub request_timeout: Duration,

    /// Send prompt caching hints where the vendor supports them
    pub prompt_caching: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            openai_api_key: None,
            grok_api_key: None,
            maritaca_api_key: None,
            cohere_api_key: None,
            bedrock_api_key: None,
            anthropic_base_url: DEFAULT_ANTHROPIC_URL.into(),
            openai_base_url: DEFAULT_OPENAI_URL.into(),
            grok_base_url: DEFAULT_GROK_URL.into(),
            maritaca_base_url: DEFAULT_MARITACA_URL.into(),
            ollama_host: DEFAULT_OLLAMA_HOST.into(),
            vllm_host: DEFAULT_VLLM_HOST.into(),
            cohere_base_url: DEFAULT_COHERE_URL.into(),
            bedrock_openai_url: DEFAULT_BEDROCK_OPENAI_URL.into(),
            chat_log_dir: Some(PathBuf::from("chat_logs")),
            tool_mode: ToolMode::Native,
            max_tool_rounds: 10,
            default_model: DEFAULT_MODEL.into(),
            request_timeout: DEFAULT_TIMEOUT,
            prompt_caching: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let secret = |key: &str| var(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let tool_mode = match var("AGENT_TOOL_MODE").filter(|v| !v.is_empty()) {
            Some(mode) => mode.parse()?,
            None => defaults.tool_mode,
        };
        let max_tool_rounds = match var("AGENT_MAX_TOOL_ROUNDS").filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse().map_err(|_| {
                AgentError::Config(format!("AGENT_MAX_TOOL_ROUNDS must be a number, got '{raw}'"))
            })?,
            None => defaults.max_tool_rounds,
        };
        let chat_log_dir = match var("AGENT_CHAT_LOG_DIR") {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => defaults.chat_log_dir,
        };
        let prompt_caching = match var("AGENT_PROMPT_CACHING").filter(|v| !v.is_empty()) {
            Some(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => defaults.prompt_caching,
        };

        Ok(Self {
            anthropic_api_key: secret("ANTHROPIC_API_KEY"),
            openai_api_key: secret("OPENAI_API_KEY"),
            grok_api_key: secret("GROK_API_KEY"),
            maritaca_api_key: secret("MARITACA_API_KEY"),
            cohere_api_key: secret("COHERE_API_KEY"),
            bedrock_api_key: secret("AWS_BEDROCK_API_KEY"),
            anthropic_base_url: secret("ANTHROPIC_BASE_URL").unwrap_or(defaults.anthropic_base_url),
            openai_base_url: secret("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            grok_base_url: secret("GROK_BASE_URL").unwrap_or(defaults.grok_base_url),
            maritaca_base_url: secret("MARITACA_BASE_URL").unwrap_or(defaults.maritaca_base_url),
            ollama_host: secret("OLLAMA_HOST").unwrap_or(defaults.ollama_host),
            vllm_host: secret("VLLM_HOST").unwrap_or(defaults.vllm_host),
            cohere_base_url: secret("COHERE_BASE_URL").unwrap_or(defaults.cohere_base_url),
            bedrock_openai_url: secret("AWS_BEDROCK_OPENAI_URL").unwrap_or(defaults.bedrock_openai_url),
            chat_log_dir,
            tool_mode,
            max_tool_rounds,
            default_model: secret("AGENT_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            request_timeout: defaults.request_timeout,
            prompt_caching,
        })
    }
}

/// Anthropic Messages API settings
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub caching: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryPolicy,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ANTHROPIC_URL.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            caching: true,
            max_tokens: 4000,
            temperature: 0.5,
            retry: RetryPolicy::new(5, Duration::from_secs(6)),
        }
    }
}

impl AnthropicConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            base_url: config.anthropic_base_url.clone(),
            api_key: config.anthropic_api_key.clone(),
            timeout: config.request_timeout,
            caching: config.prompt_caching,
            ..Self::default()
        }
    }
}

/// OpenAI-compatible Chat Completions settings
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL up to and including the version segment (e.g. `.../v1`)
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /// `reasoning_effort` for reasoning models
    pub reasoning_effort: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            max_tokens: 4000,
            temperature: 0.5,
            reasoning_effort: None,
            retry: RetryPolicy::new(3, Duration::from_secs(60)),
        }
    }
}

/// Cohere Chat v1 settings
#[derive(Clone, Debug)]
pub struct CohereConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryPolicy,
}

impl Default for CohereConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_COHERE_URL.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            max_tokens: 4000,
            temperature: 0.5,
            retry: RetryPolicy::new(25, Duration::from_secs(60)),
        }
    }
}

impl CohereConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            base_url: config.cohere_base_url.clone(),
            api_key: config.cohere_api_key.clone(),
            timeout: config.request_timeout,
            ..Self::default()
        }
    }
}

/// Join a base URL and a path without doubling slashes
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
