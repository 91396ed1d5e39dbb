//! OpenAI-compatible LLM provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the OpenAI chat completions API format.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::brain::{CompletionRequest, CompletionResponse, LlmProvider, TokenUsage};
use crate::config::LlmConfig;
use crate::error::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible LLM provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Uses `config.api_key` when set, otherwise reads the environment variable
    /// named by `config.api_key_env`. Local endpoints need no key.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&config.api_key_env).ok())
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!(
                    "OpenAI-compatible: env var '{}' not set",
                    config.api_key_env
                ),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Parse an OpenAI-format response body into a CompletionResponse.
    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let choice =
            body.get("choices")
                .and_then(|c| c.get(0))
                .ok_or_else(|| LlmError::ResponseParse {
                    message: "No choices in response".to_string(),
                })?;

        let message = choice
            .get("message")
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message in choice".to_string(),
            })?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let usage = body
            .get("usage")
            .map(|u| TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                    as usize,
                output_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
            })
            .unwrap_or_default();

        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(CompletionResponse { text, model, usage })
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed ({})", status);
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // Header first, then "... try again in Xs" in the error message.
                let retry_secs = retry_after
                    .or_else(|| {
                        serde_json::from_str::<Value>(body)
                            .ok()
                            .and_then(|v| {
                                v.get("error")?
                                    .get("message")?
                                    .as_str()
                                    .map(|s| s.to_string())
                            })
                            .and_then(|msg| {
                                msg.split("in ")
                                    .last()
                                    .and_then(|s| s.trim_end_matches(['s', '.']).parse::<u64>().ok())
                            })
                    })
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            code if code >= 500 => LlmError::Connection {
                message: format!("Server error ({}): {}", status, body),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            LlmError::Connection {
                message: format!("Request failed: {}", e),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let response_body = response.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;

        Self::parse_response(&json, &self.model)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn test_config() -> LlmConfig {
        LlmConfig {
            model: "gpt-4o-mini".to_string(),
            api_key_env: "MEDLIT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_request_body_with_system_prompt() {
        let provider = OpenAiCompatibleProvider::new_with_key(&test_config(), "k".into()).unwrap();
        let body = provider.request_body(&CompletionRequest {
            system: Some("Cite sources.".into()),
            prompt: "Question".into(),
            temperature: 0.2,
            max_tokens: Some(256),
        });
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Question");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn test_request_body_without_system_prompt() {
        let provider = OpenAiCompatibleProvider::new_with_key(&test_config(), "k".into()).unwrap();
        let body = provider.request_body(&CompletionRequest {
            system: None,
            prompt: "Is this medical?".into(),
            temperature: 0.0,
            max_tokens: None,
        });
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_text_response() {
        let body = json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "message": { "role": "assistant", "content": "yes" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 42, "completion_tokens": 1 }
        });
        let response = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o-mini").unwrap();
        assert_eq!(response.text, "yes");
        assert_eq!(response.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(response.usage.input_tokens, 42);
        assert_eq!(response.usage.output_tokens, 1);
    }

    #[test]
    fn test_parse_response_no_choices() {
        let body = json!({ "choices": [] });
        let result = OpenAiCompatibleProvider::parse_response(&body, "m");
        assert!(matches!(result, Err(LlmError::ResponseParse { .. })));
    }

    #[test]
    fn test_parse_response_empty_content() {
        let body = json!({ "choices": [{ "message": { "content": null } }] });
        let result = OpenAiCompatibleProvider::parse_response(&body, "m");
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn test_http_error_mapping_401() {
        let err = OpenAiCompatibleProvider::map_http_error(
            StatusCode::UNAUTHORIZED,
            None,
            r#"{"error":{"message":"bad key"}}"#,
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn test_http_error_mapping_429() {
        let err = OpenAiCompatibleProvider::map_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            None,
            r#"{"error":{"message":"Rate limit reached. Please try again in 20s"}}"#,
        );
        match err {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 20),
            other => panic!("Expected RateLimited, got {:?}", other),
        }

        let err =
            OpenAiCompatibleProvider::map_http_error(StatusCode::TOO_MANY_REQUESTS, Some(3), "");
        assert!(matches!(
            err,
            LlmError::RateLimited {
                retry_after_secs: 3
            }
        ));
    }

    #[test]
    fn test_http_error_mapping_500_is_transient() {
        let err = OpenAiCompatibleProvider::map_http_error(
            StatusCode::BAD_GATEWAY,
            None,
            "upstream unavailable",
        );
        assert!(matches!(err, LlmError::Connection { .. }));
    }

    #[test]
    fn test_http_error_mapping_400() {
        let err =
            OpenAiCompatibleProvider::map_http_error(StatusCode::BAD_REQUEST, None, "bad model");
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }

    #[test]
    fn test_new_missing_key() {
        let result = OpenAiCompatibleProvider::new(&test_config());
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
    }

    #[test]
    fn test_inline_key_takes_precedence() {
        let config = LlmConfig {
            api_key: Some("sk-inline".into()),
            ..test_config()
        };
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        assert_eq!(provider.api_key, "sk-inline");
    }

    #[test]
    fn test_local_provider_no_api_key_required() {
        let config = LlmConfig {
            base_url: Some("http://localhost:11434/v1/".into()),
            model: "llama3.1:8b".into(),
            ..test_config()
        };
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        assert_eq!(provider.base_url(), "http://localhost:11434/v1");
        assert_eq!(provider.model_name(), "llama3.1:8b");
    }

    #[test]
    fn test_default_base_url() {
        let provider = OpenAiCompatibleProvider::new_with_key(&test_config(), "k".into()).unwrap();
        assert_eq!(provider.base_url(), DEFAULT_BASE_URL);
    }
}
