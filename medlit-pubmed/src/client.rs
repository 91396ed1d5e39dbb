//! HTTP client for the NCBI E-utilities endpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use medlit_core::config::MetadataConfig;
use medlit_core::metadata::{ArticleSummary, MetadataSource, dedup_identifiers};
use medlit_core::{MetadataError, RetryConfig, with_retry};
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::author::build_search_term;
use crate::parse::{parse_efetch_abstracts, parse_elink, parse_esearch, parse_esummary};

/// Stateless E-utilities client.
///
/// Holds only immutable configuration and a connection pool, so one instance
/// can serve any number of concurrent requests.
pub struct PubMedClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    email: Option<String>,
    tool: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl PubMedClient {
    /// Build a client from config. The API key is read from the configured
    /// environment variable when it is set.
    pub fn new(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::with_api_key(config, api_key)
    }

    /// Build a client with an explicitly provided (optional) API key.
    pub fn with_api_key(
        config: &MetadataConfig,
        api_key: Option<String>,
    ) -> Result<Self, MetadataError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| MetadataError::InvalidConfig {
            message: format!("metadata.base_url '{base_url}': {e}"),
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("medlit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MetadataError::InvalidConfig {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            email: config.email.clone(),
            tool: config.tool.clone(),
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("tool", self.tool.clone())];
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// One GET against `<base>/<endpoint>`, with no retry.
    async fn get_text(
        &self,
        endpoint: &str,
        params: &[(&'static str, String)],
    ) -> Result<String, MetadataError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&self.common_params())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                body: truncate(&text, 200),
            });
        }
        Ok(text)
    }

    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(&'static str, String)],
    ) -> Result<Value, MetadataError> {
        let text = with_retry(&self.retry, || self.get_text(endpoint, params)).await?;
        serde_json::from_str(&text).map_err(|e| MetadataError::ResponseParse {
            message: format!("{endpoint}: invalid JSON: {e}"),
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> MetadataError {
        if e.is_timeout() {
            MetadataError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            MetadataError::Request {
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl MetadataSource for PubMedClient {
    async fn fetch_summaries(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ArticleSummary>, MetadataError> {
        let ids = dedup_identifiers(ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let params = [
            ("db", "pubmed".to_string()),
            ("retmode", "json".to_string()),
            ("id", ids.join(",")),
        ];
        let body = self.get_json("esummary.fcgi", &params).await?;
        let summaries = parse_esummary(&body)?;
        debug!(requested = ids.len(), returned = summaries.len(), "esummary");
        Ok(summaries)
    }

    async fn fetch_citation_counts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, u64>, MetadataError> {
        let ids = dedup_identifiers(ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        // Repeated `id` parameters give one linkset per article; a single
        // comma-joined value would merge all links into one set.
        let mut params = vec![
            ("dbfrom", "pubmed".to_string()),
            ("db", "pubmed".to_string()),
            ("linkname", "pubmed_pubmed_citedin".to_string()),
            ("retmode", "json".to_string()),
        ];
        params.extend(ids.iter().map(|id| ("id", id.clone())));

        let body = self.get_json("elink.fcgi", &params).await?;
        let counts = parse_elink(&body, &ids)?;
        debug!(requested = ids.len(), "elink citedin");
        Ok(counts)
    }

    async fn fetch_abstracts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, String>, MetadataError> {
        let ids = dedup_identifiers(ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let params = [
            ("db", "pubmed".to_string()),
            ("rettype", "abstract".to_string()),
            ("retmode", "xml".to_string()),
            ("id", ids.join(",")),
        ];
        let xml = with_retry(&self.retry, || self.get_text("efetch.fcgi", &params)).await?;
        let abstracts = parse_efetch_abstracts(&xml);
        debug!(requested = ids.len(), returned = abstracts.len(), "efetch abstracts");
        Ok(abstracts)
    }

    async fn resolve_identifier(&self, title: &str, author: Option<&str>) -> Option<String> {
        if title.trim().is_empty() {
            return None;
        }
        let params = [
            ("db", "pubmed".to_string()),
            ("retmode", "json".to_string()),
            ("retmax", "1".to_string()),
            ("term", build_search_term(title, author)),
        ];
        match self.get_json("esearch.fcgi", &params).await {
            Ok(body) => parse_esearch(&body),
            Err(e) => {
                warn!(error = %e, title, "Title lookup failed");
                None
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = MetadataConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        let err = PubMedClient::with_api_key(&config, None).err().unwrap();
        assert!(matches!(err, MetadataError::InvalidConfig { .. }));
    }

    #[test]
    fn test_common_params() {
        let config = MetadataConfig {
            email: Some("team@example.org".into()),
            ..Default::default()
        };
        let client = PubMedClient::with_api_key(&config, Some("k".into())).unwrap();
        let params = client.common_params();
        assert_eq!(
            params,
            vec![
                ("tool", "medlit".to_string()),
                ("email", "team@example.org".to_string()),
                ("api_key", "k".to_string()),
            ]
        );
        assert!(client.has_api_key());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = MetadataConfig {
            base_url: "http://127.0.0.1:9/eutils/".into(),
            ..Default::default()
        };
        let client = PubMedClient::with_api_key(&config, None).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9/eutils");
        assert!(client.common_params().iter().all(|(k, _)| *k != "api_key"));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_request() {
        // Port 9 (discard) is never contacted: empty batches return early.
        let config = MetadataConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        };
        let client = PubMedClient::with_api_key(&config, None).unwrap();
        assert!(client.fetch_summaries(&[]).await.unwrap().is_empty());
        assert!(client.fetch_citation_counts(&[" ".into()]).await.unwrap().is_empty());
        assert!(client.fetch_abstracts(&[]).await.unwrap().is_empty());
        assert_eq!(client.resolve_identifier("  ", None).await, None);
    }

    #[tokio::test]
    #[ignore] // Requires network access to eutils.ncbi.nlm.nih.gov
    async fn test_live_summary_and_citations() {
        let client = PubMedClient::new(&MetadataConfig::default()).unwrap();
        let ids = vec!["31452104".to_string()];
        let summaries = client.fetch_summaries(&ids).await.unwrap();
        assert!(summaries.contains_key("31452104"));
        let counts = client.fetch_citation_counts(&ids).await.unwrap();
        assert!(counts.contains_key("31452104"));
    }
}
