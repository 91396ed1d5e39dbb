//! Vector retrieval over an embedded literature index.
//!
//! [`VectorSearch`] is the pipeline's only view of the index. The HTTP
//! implementation embeds the query through an OpenAI-compatible
//! `/embeddings` endpoint and queries a Pinecone-style `/query` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::{RetrievalConfig, RetryConfig};
use crate::error::RetrievalError;
use crate::retry::with_retry;
use crate::types::{Candidate, SourceMetadata, normalize_identifier};

const CONTENT_KEYS: &[&str] = &["text", "content", "chunk"];
const IDENTIFIER_KEYS: &[&str] = &["pmid", "PMID", "pubmed_id"];

/// Similarity search over the literature index.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Up to `top_k` candidates, most similar first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError>;
}

/// HTTP vector index client: query embedding plus nearest-neighbour lookup.
pub struct HttpVectorIndex {
    client: Client,
    index_url: String,
    index_api_key: String,
    namespace: Option<String>,
    embedding_url: String,
    embedding_model: String,
    embedding_api_key: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl HttpVectorIndex {
    /// Build a client from config, reading both API keys from the environment.
    pub fn new(config: &RetrievalConfig) -> Result<Self, RetrievalError> {
        let index_api_key =
            std::env::var(&config.api_key_env).map_err(|_| RetrievalError::AuthFailed {
                service: format!("vector index (env var '{}' not set)", config.api_key_env),
            })?;
        let embedding_api_key = std::env::var(&config.embedding_api_key_env).map_err(|_| {
            RetrievalError::AuthFailed {
                service: format!(
                    "embeddings (env var '{}' not set)",
                    config.embedding_api_key_env
                ),
            }
        })?;
        Self::with_keys(config, index_api_key, embedding_api_key)
    }

    /// Build a client with explicitly provided keys.
    pub fn with_keys(
        config: &RetrievalConfig,
        index_api_key: String,
        embedding_api_key: String,
    ) -> Result<Self, RetrievalError> {
        if config.index_url.trim().is_empty() {
            return Err(RetrievalError::Search {
                message: "retrieval.index_url is not configured".into(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("medlit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RetrievalError::Search {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            index_url: config.index_url.trim_end_matches('/').to_string(),
            index_api_key,
            namespace: config.namespace.clone(),
            embedding_url: format!(
                "{}/embeddings",
                config.embedding_base_url.trim_end_matches('/')
            ),
            embedding_model: config.embedding_model.clone(),
            embedding_api_key,
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let response = self
            .client
            .post(&self.embedding_url)
            .bearer_auth(&self.embedding_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, "embeddings"))?;

        let json = self.read_json(response, "embeddings").await?;
        parse_embedding(&json)
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(namespace) = &self.namespace {
            body["namespace"] = json!(namespace);
        }

        let response = self
            .client
            .post(format!("{}/query", self.index_url))
            .header("Api-Key", &self.index_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, "vector index"))?;

        let json = self.read_json(response, "vector index").await?;
        parse_matches(&json)
    }

    async fn read_json(
        &self,
        response: reqwest::Response,
        service: &str,
    ) -> Result<Value, RetrievalError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e, service))?;

        if !status.is_success() {
            return Err(status_error(service, status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| RetrievalError::ResponseParse {
            message: format!("{service}: invalid JSON: {e}"),
        })
    }

    fn map_send_error(&self, e: reqwest::Error, service: &str) -> RetrievalError {
        if e.is_timeout() {
            RetrievalError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else if service == "embeddings" {
            RetrievalError::Embedding {
                message: e.to_string(),
            }
        } else {
            RetrievalError::Search {
                message: e.to_string(),
            }
        }
    }
}

/// Map a non-2xx response to an error; only 429 and 5xx are retried.
fn status_error(service: &str, status: u16, body: &str) -> RetrievalError {
    match status {
        401 | 403 => RetrievalError::AuthFailed {
            service: service.to_string(),
        },
        _ => RetrievalError::Status {
            service: service.to_string(),
            status,
            body: truncate(body, 200),
        },
    }
}

#[async_trait]
impl VectorSearch for HttpVectorIndex {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let vector = with_retry(&self.retry, || self.embed(query)).await?;
        let candidates = with_retry(&self.retry, || self.query(&vector, top_k)).await?;
        debug!(top_k, returned = candidates.len(), "Vector search complete");
        Ok(candidates)
    }
}

/// Extract `data[0].embedding` from an embeddings response.
pub fn parse_embedding(body: &Value) -> Result<Vec<f32>, RetrievalError> {
    let values = body
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| RetrievalError::ResponseParse {
            message: "No embedding in response".into(),
        })?;
    let vector: Vec<f32> = values
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect();
    if vector.is_empty() || vector.len() != values.len() {
        return Err(RetrievalError::ResponseParse {
            message: "Embedding is empty or non-numeric".into(),
        });
    }
    Ok(vector)
}

/// Convert a `/query` response into candidates, preserving match order.
///
/// Matches without any text content are skipped.
pub fn parse_matches(body: &Value) -> Result<Vec<Candidate>, RetrievalError> {
    let matches = body
        .get("matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| RetrievalError::ResponseParse {
            message: "No matches array in response".into(),
        })?;

    let mut candidates = Vec::with_capacity(matches.len());
    for m in matches {
        let metadata = m.get("metadata").unwrap_or(&Value::Null);
        let Some(content) = first_string(metadata, CONTENT_KEYS).filter(|c| !c.trim().is_empty())
        else {
            debug!(id = ?m.get("id"), "Skipping match without text content");
            continue;
        };

        let identifier = first_string(metadata, IDENTIFIER_KEYS)
            .as_deref()
            .and_then(normalize_identifier)
            .map(str::to_string);
        let similarity = m.get("score").and_then(|s| s.as_f64()).unwrap_or(1.0);

        let mut candidate = Candidate::new(content).with_similarity(similarity);
        candidate.identifier = identifier;
        candidate.source = SourceMetadata {
            title: first_string(metadata, &["title"]),
            author: first_string(metadata, &["author"]),
            citation: first_string(metadata, &["citation"]),
            last_updated: first_string(metadata, &["last_updated"]),
        };
        candidates.push(candidate);
    }
    Ok(candidates)
}

/// First of `keys` holding a string or number, as a string.
fn first_string(metadata: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match metadata.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        }),
        _ => None,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Fixed-result search for tests and offline runs.
pub struct StaticVectorSearch {
    candidates: Vec<Candidate>,
    fail: bool,
    calls: AtomicUsize,
    last_query: Mutex<Option<String>>,
}

impl StaticVectorSearch {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            fail: false,
            calls: AtomicUsize::new(0),
            last_query: Mutex::new(None),
        }
    }

    /// A search whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The query text of the most recent call.
    pub fn last_query(&self) -> Option<String> {
        self.last_query
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl VectorSearch for StaticVectorSearch {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap_or_else(|e| e.into_inner()) = Some(query.to_string());
        if self.fail {
            return Err(RetrievalError::Search {
                message: "index unavailable".into(),
            });
        }
        Ok(self.candidates.iter().take(top_k).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_matches_maps_metadata() {
        let body = json!({
            "matches": [
                {
                    "id": "chunk-1",
                    "score": 0.91,
                    "metadata": {
                        "text": "Iron deficiency is a common cause of fatigue.",
                        "pmid": "31234567",
                        "title": "Fatigue in primary care",
                        "author": "Smith J",
                        "citation": "BMJ 2019;365:l1234",
                        "last_updated": "2019-06-01"
                    }
                },
                {
                    "id": "chunk-2",
                    "score": 0.80,
                    "metadata": { "content": "Hypothyroidism presents with fatigue.", "PMID": 29876543 }
                }
            ]
        });
        let candidates = parse_matches(&body).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].identifier.as_deref(), Some("31234567"));
        assert_eq!(candidates[0].source.author.as_deref(), Some("Smith J"));
        assert_eq!(
            candidates[0].source.last_updated.as_deref(),
            Some("2019-06-01")
        );
        assert!((candidates[0].vector_similarity - 0.91).abs() < 1e-9);
        assert_eq!(candidates[1].identifier.as_deref(), Some("29876543"));
        assert_eq!(candidates[1].content, "Hypothyroidism presents with fatigue.");
    }

    #[test]
    fn test_parse_matches_drops_sentinel_identifiers() {
        let body = json!({
            "matches": [
                { "score": 0.5, "metadata": { "chunk": "a", "pubmed_id": "nan" } },
                { "score": 0.5, "metadata": { "chunk": "b", "pmid": "" } },
                { "score": 0.5, "metadata": { "chunk": "c", "pmid": 0 } }
            ]
        });
        let candidates = parse_matches(&body).unwrap();
        assert!(candidates.iter().all(|c| c.identifier.is_none()));
    }

    #[test]
    fn test_parse_matches_clamps_and_defaults_score() {
        let body = json!({
            "matches": [
                { "score": 1.7, "metadata": { "text": "a" } },
                { "score": -0.2, "metadata": { "text": "b" } },
                { "metadata": { "text": "c" } }
            ]
        });
        let candidates = parse_matches(&body).unwrap();
        assert_eq!(candidates[0].vector_similarity, 1.0);
        assert_eq!(candidates[1].vector_similarity, 0.0);
        assert_eq!(candidates[2].vector_similarity, 1.0);
    }

    #[test]
    fn test_parse_matches_skips_empty_content() {
        let body = json!({
            "matches": [
                { "score": 0.9, "metadata": { "title": "No text here" } },
                { "score": 0.8, "metadata": { "text": "   " } },
                { "score": 0.7, "metadata": { "text": "kept" } }
            ]
        });
        let candidates = parse_matches(&body).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].content, "kept");
    }

    #[test]
    fn test_parse_matches_requires_array() {
        assert!(matches!(
            parse_matches(&json!({ "results": [] })),
            Err(RetrievalError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_parse_embedding() {
        let body = json!({ "data": [{ "embedding": [0.1, -0.2, 0.3] }] });
        assert_eq!(parse_embedding(&body).unwrap().len(), 3);
        assert!(parse_embedding(&json!({ "data": [] })).is_err());
        assert!(parse_embedding(&json!({ "data": [{ "embedding": ["x"] }] })).is_err());
    }

    #[test]
    fn test_status_errors_retry_only_throttling_and_server_faults() {
        use crate::retry::Transient;

        let bad_request = status_error("embeddings", 400, "input too long");
        assert!(!bad_request.is_transient());
        assert_eq!(
            bad_request.to_string(),
            "embeddings returned status 400: input too long"
        );
        assert!(!status_error("vector index", 404, "no such index").is_transient());
        assert!(status_error("vector index", 429, "slow down").is_transient());
        assert!(status_error("vector index", 503, "").is_transient());
        assert!(matches!(
            status_error("vector index", 403, ""),
            RetrievalError::AuthFailed { .. }
        ));
    }

    #[test]
    fn test_http_index_requires_url() {
        let config = RetrievalConfig::default();
        let result = HttpVectorIndex::with_keys(&config, "k".into(), "k".into());
        assert!(matches!(result, Err(RetrievalError::Search { .. })));
    }

    #[test]
    fn test_http_index_missing_key() {
        let config = RetrievalConfig {
            index_url: "https://index.example.org".into(),
            api_key_env: "MEDLIT_TEST_INDEX_KEY_THAT_IS_NEVER_SET".into(),
            ..RetrievalConfig::default()
        };
        assert!(matches!(
            HttpVectorIndex::new(&config),
            Err(RetrievalError::AuthFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_static_search_truncates_and_records_query() {
        let search = StaticVectorSearch::new(vec![
            Candidate::new("a"),
            Candidate::new("b"),
            Candidate::new("c"),
        ]);
        let results = search.search("fatigue causes", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(search.last_query().as_deref(), Some("fatigue causes"));
        assert_eq!(search.call_count(), 1);
    }

    #[tokio::test]
    async fn test_static_search_failure() {
        let search = StaticVectorSearch::failing();
        assert!(search.search("q", 5).await.is_err());
    }
}
