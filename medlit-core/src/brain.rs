//! Brain module: LLM provider abstraction and the capabilities built on it.
//!
//! The pipeline never talks to a provider directly. It depends on three
//! single-method capabilities: [`Classify`], [`Rewrite`] and [`Synthesize`].
//! [`Brain`] implements all three on top of any [`LlmProvider`], and tests
//! substitute fixed-response fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::retry::with_retry;

/// A single-turn completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A completed model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Yes/no classification of a prompt.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<bool, LlmError>;
}

/// Free-text rewrite of a prompt. An empty result counts as failure.
#[async_trait]
pub trait Rewrite: Send + Sync {
    async fn rewrite(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Answer generation from a system and user prompt.
#[async_trait]
pub trait Synthesize: Send + Sync {
    async fn synthesize(&self, system_prompt: &str, user_prompt: &str)
    -> Result<String, LlmError>;
}

/// Normalize a model's yes/no answer.
///
/// Only the first word counts, ignoring case and punctuation. Anything other
/// than "yes" or "no" is a parse error rather than a guess.
pub fn parse_yes_no(text: &str) -> Result<bool, LlmError> {
    let lowered = text.to_lowercase();
    let first_word = lowered
        .split(|c: char| !c.is_alphabetic())
        .find(|w| !w.is_empty());
    match first_word {
        Some("yes") => Ok(true),
        Some("no") => Ok(false),
        _ => Err(LlmError::ResponseParse {
            message: format!("expected yes/no, got {:?}", truncate(text, 40)),
        }),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Capability adapter over an [`LlmProvider`] with per-call retry.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: usize,
    retry: RetryConfig,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: config.retry.clone(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    async fn complete_text(
        &self,
        system: Option<&str>,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest {
            system: system.map(str::to_string),
            prompt: prompt.to_string(),
            temperature,
            max_tokens: Some(max_tokens),
        };
        let response = with_retry(&self.retry, || self.provider.complete(request.clone())).await?;
        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );
        let text = response.text.trim().to_string();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl Classify for Brain {
    async fn classify(&self, prompt: &str) -> Result<bool, LlmError> {
        let text = self.complete_text(None, prompt, 0.0, 5).await?;
        parse_yes_no(&text)
    }
}

#[async_trait]
impl Rewrite for Brain {
    async fn rewrite(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete_text(None, prompt, self.temperature, 200).await
    }
}

#[async_trait]
impl Synthesize for Brain {
    async fn synthesize(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        self.complete_text(
            Some(system_prompt),
            user_prompt,
            self.temperature,
            self.max_tokens,
        )
        .await
    }
}

/// A mock LLM provider for testing and offline development.
pub struct MockLlmProvider {
    model: String,
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a provider that answers the next `count` calls with `text`.
    pub fn with_response(text: &str, count: usize) -> Self {
        let provider = Self::new();
        for _ in 0..count {
            provider.queue_response(text);
        }
        provider
    }

    /// Queue a text response for the next `complete` call.
    pub fn queue_response(&self, text: &str) {
        self.lock_responses().push_back(Ok(text.to_string()));
    }

    /// Queue an error for the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        self.lock_responses().push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self.lock_responses().pop_front();
        let text = match next {
            Some(result) => result?,
            None => "I'm a mock LLM. No queued responses available.".to_string(),
        };
        Ok(CompletionResponse {
            text,
            model: self.model.clone(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
