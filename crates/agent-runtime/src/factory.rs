//! Model catalogue and adapter factory
//!
//! Display names map to a wire family, a model id and a price. Outdated
//! entries still work but come back with a deprecation advisory.

use agent_core::provider::{Pricing, VendorAdapter};
use agent_core::{AgentError, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::anthropic::AnthropicAdapter;
use crate::cohere::CohereAdapter;
use crate::config::{AnthropicConfig, CohereConfig, RuntimeConfig};
use crate::openai::{OpenAiAdapter, OpenAiPreset};

use ModelStatus::{Current, Outdated};
use OpenAiPreset::{BedrockOpenAi, Grok, Maritaca, Ollama, OpenAi, Vllm};

/// Whether a catalogue entry is still recommended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Current,
    Outdated,
}

/// Wire family (and preset) used for a model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Anthropic,
    OpenAi {
        preset: OpenAiPreset,
        reasoning_effort: Option<&'static str>,
    },
    Cohere,
}

/// One catalogue entry
#[derive(Clone, Debug, Serialize)]
pub struct ModelEntry {
    pub key: &'static str,
    pub model_id: &'static str,
    pub description: &'static str,
    pub pricing: Pricing,
    pub status: ModelStatus,
    #[serde(skip)]
    pub backend: Backend,
}

/// Advisory attached to an adapter built from an outdated entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    Deprecated { model: String, message: String },
}

const fn anthropic(
    key: &'static str,
    model_id: &'static str,
    description: &'static str,
    pricing: Pricing,
    status: ModelStatus,
) -> ModelEntry {
    ModelEntry {
        key,
        model_id,
        description,
        pricing,
        status,
        backend: Backend::Anthropic,
    }
}

const fn openai(
    preset: OpenAiPreset,
    key: &'static str,
    model_id: &'static str,
    description: &'static str,
    pricing: Pricing,
    status: ModelStatus,
) -> ModelEntry {
    ModelEntry {
        key,
        model_id,
        description,
        pricing,
        status,
        backend: Backend::OpenAi {
            preset,
            reasoning_effort: None,
        },
    }
}

const fn reasoning(mut entry: ModelEntry) -> ModelEntry {
    if let Backend::OpenAi { preset, .. } = entry.backend {
        entry.backend = Backend::OpenAi {
            preset,
            reasoning_effort: Some("low"),
        };
    }
    entry
}

const fn local(
    preset: OpenAiPreset,
    key: &'static str,
    model_id: &'static str,
    description: &'static str,
    status: ModelStatus,
) -> ModelEntry {
    openai(preset, key, model_id, description, Pricing::new(0.0, 0.0), status)
}

const fn cohere(
    key: &'static str,
    model_id: &'static str,
    description: &'static str,
    pricing: Pricing,
    status: ModelStatus,
) -> ModelEntry {
    ModelEntry {
        key,
        model_id,
        description,
        pricing,
        status,
        backend: Backend::Cohere,
    }
}

static CATALOGUE: &[ModelEntry] = &[
    // Local
    local(Ollama, "Qwen 3 0.6b - Ollama", "qwen3:0.6b", "Qwen 3 0.6b (Tiny-size LLM) - locally from Ollama", Current),
    local(Ollama, "OpenAI GPT OSS 20b - Ollama", "gpt-oss:20b", "OpenAI GPT OSS 20b (Small-size LLM) - locally from Ollama", Current),
    local(Ollama, "OpenAI GPT OSS 120b - Ollama", "gpt-oss:120b", "OpenAI GPT OSS 120b (Medium-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3 1.7b - Ollama", "qwen3:1.7b", "Qwen 3 1.7b (Tiny-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3 4b - Ollama", "qwen3:4b", "Qwen 3 4b (Small-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3 8b - Ollama", "qwen3:8b", "Qwen 3 8b (Small-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3 14b - Ollama", "qwen3:14b", "Qwen 3 14b (Small-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3 Coder 30b - Ollama", "qwen3-coder:30b", "Qwen 3 Coder 30b (Medium-size LLM) - locally from Ollama", Current),
    local(Ollama, "Llama4 16x17b - Ollama", "llama4:16x17b", "Llama 4 16x17b (Small-size LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3vl 8b - Ollama", "qwen3-vl:8b", "Qwen 3 VL 8b (Small-size vision LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3vl 4b - Ollama", "qwen3-vl:4b", "Qwen 3 VL 4b (Small-size vision LLM) - locally from Ollama", Current),
    local(Ollama, "Qwen 3vl 2b - Ollama", "qwen3-vl:2b", "Qwen 3 VL 2b (Tiny-size vision LLM) - locally from Ollama", Current),
    local(Ollama, "DeepSeek R1 14b - Ollama", "deepseek-r1:14b", "DeepSeek R1 14b (Small-size LLM) - locally from Ollama", Current),
    local(Vllm, "Qwen 3 1.7b - VLLM", "Qwen/Qwen3-1.7B", "Qwen 3 1.7b (Tiny-size LLM) - locally from vLLM", Current),
    // Bedrock through its OpenAI-compatible endpoint
    openai(BedrockOpenAi, "OpenAI GPT OSS 20b - AWSBedrock_OpenAI", "openai.gpt-oss-20b-1:0", "OpenAI GPT OSS 20b - AWS Bedrock via OpenAI API", Pricing::new(0.07, 0.3), Current),
    openai(BedrockOpenAi, "OpenAI GPT OSS 120b - AWSBedrock_OpenAI", "openai.gpt-oss-120b-1:0", "OpenAI GPT OSS 120b - AWS Bedrock via OpenAI API", Pricing::new(0.15, 0.6), Current),
    // Grok
    openai(Grok, "Grok4 - Grok", "grok-4", "Grok 4 (Large-size LLM) - directly from xAI", Pricing::new(3.0, 15.0), Current),
    openai(Grok, "Grok4 Fast reasoning - Grok", "grok-4-fast-reasoning", "Grok 4 Fast reasoning - directly from xAI", Pricing::new(0.2, 0.5), Current),
    openai(Grok, "Grok4 Fast nonreasoning - Grok", "grok-4-fast-non-reasoning", "Grok 4 Fast non-reasoning - directly from xAI", Pricing::new(0.2, 0.5), Current),
    // Maritaca
    openai(Maritaca, "Sabia3 - Maritaca", "sabia-3", "Sabia-3 (Medium-size LLM) - directly from Maritaca", Pricing::new(0.95, 1.9), Current),
    // OpenAI
    reasoning(openai(OpenAi, "GPT 5_1 - OpenAI", "gpt-5.1", "GPT 5.1 (Large-size LLM) - directly from OpenAI", Pricing::new(1.25, 10.0), Current)),
    reasoning(openai(OpenAi, "GPT 5 mini - OpenAI", "gpt-5-mini", "GPT 5 mini (Medium-size LLM) - directly from OpenAI", Pricing::new(0.25, 2.0), Current)),
    reasoning(openai(OpenAi, "GPT 5 nano - OpenAI", "gpt-5-nano", "GPT 5 nano (Small-size LLM) - directly from OpenAI", Pricing::new(0.05, 0.4), Current)),
    // Anthropic
    anthropic("Claude 4.5 Sonnet - Anthropic", "claude-sonnet-4-5-20250929", "Anthropic Claude 4.5 Sonnet (Medium-size LLM) - directly from Anthropic", Pricing::new(3.0, 15.0), Current),
    anthropic("Claude 4.5 Haiku - Anthropic", "claude-haiku-4-5-20251001", "Anthropic Claude 4.5 Haiku (Small-size LLM) - directly from Anthropic", Pricing::new(1.0, 5.0), Current),
    // Outdated
    anthropic("Claude 4 Sonnet - Anthropic", "claude-sonnet-4-20250514", "Anthropic Claude 4 Sonnet (Medium-size LLM) - directly from Anthropic", Pricing::new(3.0, 15.0), Outdated),
    anthropic("Claude 4 Opus - Anthropic", "claude-opus-4-20250514", "Anthropic Claude 4 Opus (Large-size LLM) - directly from Anthropic", Pricing::new(15.0, 75.0), Outdated),
    anthropic("Claude 3.7 Sonnet - Anthropic", "claude-3-7-sonnet-20250219", "Anthropic Claude 3.7 Sonnet (Medium-size LLM) - directly from Anthropic", Pricing::new(3.0, 15.0), Outdated),
    anthropic("Claude 3.5 Sonnet - Anthropic", "claude-3-5-sonnet-20241022", "Anthropic Claude 3.5 Sonnet (Medium-size LLM) - directly from Anthropic", Pricing::new(3.0, 15.0), Outdated),
    anthropic("Claude 3.5 Haiku - Anthropic", "claude-3-5-haiku-20241022", "Anthropic Claude 3.5 Haiku (Small-size LLM) - directly from Anthropic", Pricing::new(1.0, 5.0), Outdated),
    anthropic("Claude 3 Opus - Anthropic", "claude-3-opus-20240229", "Anthropic Claude 3 Opus (Large-size LLM) - directly from Anthropic", Pricing::new(15.0, 75.0), Outdated),
    anthropic("Claude 3 Haiku - Anthropic", "claude-3-haiku-20240307", "Anthropic Claude 3 Haiku (Small-size LLM) - directly from Anthropic", Pricing::new(0.25, 1.25), Outdated),
    openai(Grok, "Grok2Vision - Grok", "grok-2-vision-1212", "Grok 2 (Medium-size LLM) - directly from xAI", Pricing::new(2.0, 10.0), Outdated),
    reasoning(openai(OpenAi, "GPT 5 - OpenAI", "gpt-5", "GPT 5 (Large-size LLM) - directly from OpenAI", Pricing::new(1.25, 10.0), Outdated)),
    openai(OpenAi, "GPT 4.1 - OpenAI", "gpt-4.1", "GPT 4.1 (Large-size LLM) - directly from OpenAI", Pricing::new(2.0, 8.0), Outdated),
    openai(OpenAi, "GPT 4o - OpenAI", "gpt-4o", "GPT 4o (Large-size LLM) - directly from OpenAI", Pricing::new(2.5, 10.0), Outdated),
    openai(OpenAi, "GPT 4o mini - OpenAI", "gpt-4o-mini", "GPT 4o mini (Small-size LLM) - directly from OpenAI", Pricing::new(0.15, 0.6), Outdated),
    openai(OpenAi, "GPT 3.5 - OpenAI", "gpt-3.5-turbo", "GPT 3.5 Turbo (Medium-size LLM) - directly from OpenAI", Pricing::new(0.5, 1.5), Outdated),
    local(Ollama, "Qwen 2.5vl 7b - Ollama", "qwen2.5vl:7b", "Qwen 2.5 VL 7b (Small-size vision LLM) - locally from Ollama", Outdated),
    local(Ollama, "Qwen 2.5vl 3b - Ollama", "qwen2.5vl:3b", "Qwen 2.5 VL 3b (Small-size vision LLM) - locally from Ollama", Outdated),
    cohere("Command R - Cohere", "command-r-08-2024", "Cohere Command R (Medium-size LLM) - directly from Cohere", Pricing::new(0.15, 0.6), Outdated),
    cohere("Command RPlus - Cohere", "command-r-plus-08-2024", "Cohere Command R+ (Large-size LLM) - directly from Cohere", Pricing::new(2.5, 10.0), Outdated),
];

/// Builds adapters from catalogue keys
#[derive(Clone, Debug)]
pub struct AdapterFactory {
    config: RuntimeConfig,
}

impl AdapterFactory {
    pub const fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// All entries, current first, in a stable order
    pub fn entries() -> impl Iterator<Item = &'static ModelEntry> {
        CATALOGUE
            .iter()
            .filter(|e| e.status == Current)
            .chain(CATALOGUE.iter().filter(|e| e.status == Outdated))
    }

    /// Catalogue keys, current first
    pub fn keys() -> Vec<&'static str> {
        Self::entries().map(|e| e.key).collect()
    }

    pub fn entry(key: &str) -> Option<&'static ModelEntry> {
        CATALOGUE.iter().find(|e| e.key == key)
    }

    /// Build the adapter for `key`
    pub fn create(&self, key: &str) -> Result<(Arc<dyn VendorAdapter>, Option<Advisory>)> {
        let entry = Self::entry(key).ok_or_else(|| {
            let allowed: Vec<_> = CATALOGUE
                .iter()
                .filter(|e| e.status == Current)
                .map(|e| e.key)
                .collect();
            AgentError::Config(format!(
                "Unknown model '{key}'. LLM has to be one of: {}",
                allowed.join(", ")
            ))
        })?;

        let adapter: Arc<dyn VendorAdapter> = match entry.backend {
            Backend::Anthropic => Arc::new(AnthropicAdapter::new(
                entry.model_id,
                entry.pricing,
                AnthropicConfig::from_runtime(&self.config),
            )?),
            Backend::OpenAi {
                preset,
                reasoning_effort,
            } => {
                let adapter =
                    OpenAiAdapter::preset(preset, entry.model_id, entry.pricing, &self.config)?;
                Arc::new(match reasoning_effort {
                    Some(effort) => adapter.reasoning_effort(effort),
                    None => adapter,
                })
            }
            Backend::Cohere => Arc::new(CohereAdapter::new(
                entry.model_id,
                entry.pricing,
                CohereConfig::from_runtime(&self.config),
            )?),
        };

        let advisory = (entry.status == Outdated).then(|| {
            let message =
                format!("Selected model is outdated: {key}. Consider switching to a newer model.");
            warn!(model = %key, "{message}");
            Advisory::Deprecated {
                model: key.to_string(),
                message,
            }
        });
        Ok((adapter, advisory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn factory() -> AdapterFactory {
        AdapterFactory::new(RuntimeConfig::default())
    }

    #[test]
    fn test_keys_are_unique_and_current_first() {
        let keys = AdapterFactory::keys();
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());

        let first_outdated = AdapterFactory::entries()
            .position(|e| e.status == Outdated)
            .unwrap();
        assert!(AdapterFactory::entries()
            .skip(first_outdated)
            .all(|e| e.status == Outdated));
    }

    #[test]
    fn test_create_current_model() {
        let (adapter, advisory) = factory().create("Claude 4.5 Sonnet - Anthropic").unwrap();
        assert!(advisory.is_none());
        assert_eq!(adapter.info().name, "Anthropic");
        assert_eq!(adapter.info().model, "claude-sonnet-4-5-20250929");
        assert!(adapter.info().supports_tools);
    }

    #[test]
    fn test_local_models_are_free() {
        let (adapter, _) = factory().create("Qwen 3 8b - Ollama").unwrap();
        assert_eq!(adapter.info().name, "Ollama");
        assert!((adapter.info().pricing.estimate(1000, 1000)).abs() < f64::EPSILON);

        let (vllm, _) = factory().create("Qwen 3 1.7b - VLLM").unwrap();
        assert!(!vllm.info().supports_tools);
    }

    #[test]
    fn test_outdated_model_carries_advisory() {
        let (adapter, advisory) = factory().create("Command R - Cohere").unwrap();
        assert_eq!(adapter.info().name, "Cohere");
        assert_eq!(adapter.info().retry.max_retries, 25);
        let Some(Advisory::Deprecated { model, message }) = advisory else {
            panic!("expected a deprecation advisory");
        };
        assert_eq!(model, "Command R - Cohere");
        assert!(message.contains("outdated"));
    }

    #[test]
    fn test_unknown_model_lists_allowed_keys() {
        let Err(AgentError::Config(message)) = factory().create("GPT 9000") else {
            panic!("expected a config error");
        };
        assert!(message.contains("GPT 5 mini - OpenAI"));
        assert!(!message.contains("GPT 3.5 - OpenAI"));
    }
}
