//! LLM provider implementations.
//!
//! Use `create_provider()` to instantiate the provider named in config.
//! `"mock"` yields a [`MockLlmProvider`]; every other name routes to the
//! OpenAI-compatible provider.

pub mod openai_compat;

use std::sync::Arc;

use crate::brain::{LlmProvider, MockLlmProvider};
use crate::config::LlmConfig;
use crate::error::LlmError;

pub use openai_compat::OpenAiCompatibleProvider;

/// Create an LLM provider based on the configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmProvider::new())),
        "openai" | "azure" | "ollama" | "vllm" | "lmstudio" | "openai-compatible" => {
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
        other => {
            tracing::warn!(
                provider = %other,
                "Unknown provider name; treating it as OpenAI-compatible"
            );
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
    }
}
