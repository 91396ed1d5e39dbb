//! Bibliographic metadata source abstraction.
//!
//! The enrichment funnel talks to the metadata service only through the
//! [`MetadataSource`] trait. `medlit-pubmed` provides the NCBI E-utilities
//! implementation; [`InMemoryMetadataSource`] serves tests and offline runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MetadataError;

/// Bibliographic summary of one article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub article_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
}

/// Read access to an external bibliographic metadata service.
///
/// Implementations are stateless handles, safe to share across concurrent
/// requests. All batch operations return maps keyed by identifier, so the
/// order of the service's response never leaks into document order.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Summaries for the given identifiers. Empty input yields an empty map
    /// without a network call.
    async fn fetch_summaries(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ArticleSummary>, MetadataError>;

    /// Citation counts. Every requested identifier is a key in the result;
    /// identifiers the service reports nothing for map to `0`.
    async fn fetch_citation_counts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, u64>, MetadataError>;

    /// Abstract text. Identifiers without a parsable abstract are omitted.
    async fn fetch_abstracts(&self, ids: &[String])
    -> Result<HashMap<String, String>, MetadataError>;

    /// Find the identifier of an article by title and optional author.
    ///
    /// Returns `None` on zero matches and on any failure; an unresolvable
    /// candidate is an expected outcome, not an error.
    async fn resolve_identifier(&self, title: &str, author: Option<&str>) -> Option<String>;
}

/// Deduplicate identifiers, dropping blanks and keeping first-seen order.
pub fn dedup_identifiers(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// Which operation an [`InMemoryMetadataSource`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataOperation {
    Summaries,
    CitationCounts,
    Abstracts,
    Resolve,
}

/// In-memory metadata source with call accounting and failure injection.
#[derive(Default)]
pub struct InMemoryMetadataSource {
    summaries: HashMap<String, ArticleSummary>,
    citations: HashMap<String, u64>,
    abstracts: HashMap<String, String>,
    /// Lowercased title -> identifier.
    titles: HashMap<String, String>,
    failing: Mutex<Vec<MetadataOperation>>,
    calls: Mutex<HashMap<MetadataOperation, usize>>,
    ids_requested: AtomicUsize,
}

impl InMemoryMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an article. Its title (if any) becomes resolvable.
    pub fn with_article(
        mut self,
        summary: ArticleSummary,
        citations: u64,
        abstract_text: Option<&str>,
    ) -> Self {
        let id = summary.identifier.clone();
        if let Some(title) = &summary.title {
            self.titles.insert(title.to_lowercase(), id.clone());
        }
        self.citations.insert(id.clone(), citations);
        if let Some(text) = abstract_text {
            self.abstracts.insert(id.clone(), text.to_string());
        }
        self.summaries.insert(id, summary);
        self
    }

    /// Make every future call of `operation` fail.
    pub fn fail(&self, operation: MetadataOperation) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operation);
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: MetadataOperation) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Total identifiers passed to the summary and abstract operations.
    pub fn expensive_ids_requested(&self) -> usize {
        self.ids_requested.load(Ordering::SeqCst)
    }

    fn record(&self, operation: MetadataOperation) -> Result<(), MetadataError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(operation)
            .or_insert(0) += 1;
        let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing.contains(&operation) {
            return Err(MetadataError::Request {
                message: format!("{operation:?} unavailable"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for InMemoryMetadataSource {
    async fn fetch_summaries(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ArticleSummary>, MetadataError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.record(MetadataOperation::Summaries)?;
        self.ids_requested.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids
            .iter()
            .filter_map(|id| self.summaries.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    async fn fetch_citation_counts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, u64>, MetadataError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.record(MetadataOperation::CitationCounts)?;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), self.citations.get(id).copied().unwrap_or(0)))
            .collect())
    }

    async fn fetch_abstracts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, String>, MetadataError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.record(MetadataOperation::Abstracts)?;
        self.ids_requested.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids
            .iter()
            .filter_map(|id| self.abstracts.get(id).map(|a| (id.clone(), a.clone())))
            .collect())
    }

    async fn resolve_identifier(&self, title: &str, _author: Option<&str>) -> Option<String> {
        self.record(MetadataOperation::Resolve).ok()?;
        self.titles.get(&title.trim().to_lowercase()).cloned()
    }
}
