//! Fundamental document types flowing through the evidence pipeline.

use serde::{Deserialize, Serialize};

/// Identifier values some indexes store in place of a missing PMID.
const SENTINEL_IDENTIFIERS: &[&str] = &["none", "null", "nan", "n/a", "0"];

/// Provider-supplied fields carried from the vector index.
///
/// Every field is optional and untrusted: indexes built from different
/// ingestion runs populate different subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Raw citation string as stored in the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// One document returned by vector similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// External bibliographic identifier (a PubMed ID), possibly absent.
    pub identifier: Option<String>,
    /// Retrieved text excerpt.
    pub content: String,
    pub source: SourceMetadata,
    /// Retrieval relevance in `[0, 1]`.
    pub vector_similarity: f64,
}

impl Candidate {
    /// Create a candidate with no identifier and full similarity.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            identifier: None,
            content: content.into(),
            source: SourceMetadata::default(),
            vector_similarity: 1.0,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.vector_similarity = similarity.clamp(0.0, 1.0);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.source.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.source.author = Some(author.into());
        self
    }

    /// The identifier, if it is present and not a sentinel-empty value.
    pub fn usable_identifier(&self) -> Option<&str> {
        self.identifier.as_deref().and_then(normalize_identifier)
    }
}

/// Trim an identifier and reject empty or sentinel values.
pub fn normalize_identifier(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || SENTINEL_IDENTIFIERS
            .iter()
            .any(|s| trimmed.eq_ignore_ascii_case(s))
    {
        None
    } else {
        Some(trimmed)
    }
}

/// How far a document got through the enrichment funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStage {
    /// No external metadata; every field holds its default.
    None,
    /// Citation count fetched in Phase 1.
    CitationsOnly,
    /// Summary and abstract fetched in Phase 3.
    Full,
}

/// External bibliographic metadata attached to a candidate.
///
/// Always present on an [`EnrichedDocument`], even when nothing could be
/// fetched; the [`EnrichmentStage`] says which fields are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BibliographicMetadata {
    pub citation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
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

/// A candidate plus external metadata, built up across funnel phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedDocument {
    pub candidate: Candidate,
    /// Identifier used for metadata lookups: the candidate's own, or one
    /// found by secondary lookup.
    pub identifier: Option<String>,
    pub metadata: BibliographicMetadata,
    pub stage: EnrichmentStage,
    /// Blended ranking score; zero until re-ranking.
    pub quality_score: f64,
}

impl EnrichedDocument {
    /// Wrap a candidate with all-default metadata.
    pub fn minimal(candidate: Candidate) -> Self {
        let identifier = candidate.usable_identifier().map(str::to_string);
        Self {
            candidate,
            identifier,
            metadata: BibliographicMetadata::default(),
            stage: EnrichmentStage::None,
            quality_score: 0.0,
        }
    }

    pub fn vector_similarity(&self) -> f64 {
        self.candidate.vector_similarity
    }

    pub fn citation_count(&self) -> u64 {
        self.metadata.citation_count
    }

    /// Best available title: fetched metadata first, then the index's copy.
    pub fn title(&self) -> Option<&str> {
        self.metadata
            .title
            .as_deref()
            .or(self.candidate.source.title.as_deref())
    }

    /// Four-digit publication year, when the publication date carries one.
    pub fn publication_year(&self) -> Option<u16> {
        let date = self
            .metadata
            .publication_date
            .as_deref()
            .or(self.candidate.source.last_updated.as_deref())?;
        date.split(|c: char| !c.is_ascii_digit())
            .find(|part| part.len() == 4)
            .and_then(|part| part.parse().ok())
    }

    /// Abstract if fetched, otherwise the retrieved excerpt.
    pub fn evidence_text(&self) -> &str {
        self.metadata
            .abstract_text
            .as_deref()
            .unwrap_or(&self.candidate.content)
    }
}
