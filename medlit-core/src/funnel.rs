//! Enrichment funnel: cheap signal on many candidates, expensive signal on few.
//!
//! 1. **Intake**: first `rerank_candidates` retrieved candidates, in retrieval order
//! 2. **Phase 1**: resolve missing identifiers, batch-fetch citation counts
//! 3. **Phase 2**: quality re-rank and narrow to `top_k`
//! 4. **Phase 3**: batch-fetch summaries and abstracts for the narrowed set only
//!
//! The funnel never fails. A candidate that cannot be resolved is carried with
//! default metadata; an unreachable service degrades the whole batch to
//! minimally-enriched documents; a failed Phase 3 forwards the citation-only
//! documents from Phase 2.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::FunnelConfig;
use crate::metadata::{ArticleSummary, MetadataSource, dedup_identifiers};
use crate::scoring::{ScoreWeights, rerank};
use crate::types::{Candidate, EnrichedDocument, EnrichmentStage};

/// What happened inside one funnel run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    /// Candidates admitted to Phase 1.
    pub intake: usize,
    /// Intake documents holding an identifier after secondary lookup.
    pub identified: usize,
    /// Identifiers found by title/author lookup.
    pub resolved_by_lookup: usize,
    /// Phase 1 citation fetch failed; citation counts are all defaults.
    pub citations_unavailable: bool,
    /// Identifiers sent to the Phase 3 summary and abstract calls.
    pub expensive_ids: usize,
    /// Phase 3 failed; documents carry citation counts only.
    pub details_unavailable: bool,
}

/// Ranked documents plus the run report.
#[derive(Debug, Clone)]
pub struct FunnelOutput {
    pub documents: Vec<EnrichedDocument>,
    pub report: FunnelReport,
}

/// Two-phase enrichment over a [`MetadataSource`].
pub struct EnrichmentFunnel {
    source: Arc<dyn MetadataSource>,
    config: FunnelConfig,
    weights: ScoreWeights,
}

impl EnrichmentFunnel {
    pub fn new(source: Arc<dyn MetadataSource>, config: FunnelConfig, weights: ScoreWeights) -> Self {
        Self {
            source,
            config,
            weights,
        }
    }

    /// Enrich and rank retrieved candidates.
    ///
    /// Returns `min(top_k, intake)` documents ordered by quality score.
    pub async fn enrich(&self, candidates: Vec<Candidate>) -> FunnelOutput {
        let intake: Vec<Candidate> = candidates
            .into_iter()
            .take(self.config.rerank_candidates)
            .collect();
        let mut report = FunnelReport {
            intake: intake.len(),
            ..Default::default()
        };

        let documents = self.fetch_citations(intake, &mut report).await;
        let ranked = rerank(documents, &self.weights, self.config.top_k);
        let documents = self.fetch_details(ranked, &mut report).await;

        info!(
            intake = report.intake,
            identified = report.identified,
            resolved_by_lookup = report.resolved_by_lookup,
            kept = documents.len(),
            expensive_ids = report.expensive_ids,
            "Enrichment funnel complete"
        );

        FunnelOutput { documents, report }
    }

    /// Phase 1: identifiers for every intake candidate, then one citation call.
    async fn fetch_citations(
        &self,
        intake: Vec<Candidate>,
        report: &mut FunnelReport,
    ) -> Vec<EnrichedDocument> {
        let mut documents: Vec<EnrichedDocument> =
            intake.into_iter().map(EnrichedDocument::minimal).collect();

        // One lookup at a time, in candidate order, to stay under the service's rate limit.
        for doc in &mut documents {
            if doc.identifier.is_some() {
                continue;
            }
            let Some(title) = doc
                .candidate
                .source
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
            else {
                continue;
            };
            let author = doc.candidate.source.author.as_deref();
            match self.source.resolve_identifier(title, author).await {
                Some(id) => {
                    debug!(identifier = %id, title = %title, "Resolved identifier by lookup");
                    doc.identifier = Some(id);
                    report.resolved_by_lookup += 1;
                }
                None => debug!(title = %title, "Identifier could not be resolved"),
            }
        }

        report.identified = documents.iter().filter(|d| d.identifier.is_some()).count();
        let ids = identifiers_of(&documents);
        if ids.is_empty() {
            warn!(
                intake = documents.len(),
                "No resolvable identifiers; continuing with minimally-enriched documents"
            );
            return documents;
        }

        match self.source.fetch_citation_counts(&ids).await {
            Ok(counts) => {
                for doc in &mut documents {
                    if let Some(id) = doc.identifier.as_deref() {
                        doc.metadata.citation_count = counts.get(id).copied().unwrap_or(0);
                        doc.stage = EnrichmentStage::CitationsOnly;
                    }
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    ids = ids.len(),
                    "Citation fetch failed; ranking on similarity alone"
                );
                report.citations_unavailable = true;
            }
        }

        documents
    }

    /// Phase 3: summaries and abstracts for the narrowed set, fetched concurrently.
    async fn fetch_details(
        &self,
        mut documents: Vec<EnrichedDocument>,
        report: &mut FunnelReport,
    ) -> Vec<EnrichedDocument> {
        let ids = identifiers_of(&documents);
        report.expensive_ids = ids.len();
        if ids.is_empty() {
            return documents;
        }

        let fetched = futures::future::try_join(
            self.source.fetch_summaries(&ids),
            self.source.fetch_abstracts(&ids),
        )
        .await;

        let (summaries, abstracts) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    error = %e,
                    documents = documents.len(),
                    "Detail fetch failed; forwarding citation-only documents"
                );
                report.details_unavailable = true;
                return documents;
            }
        };

        for doc in &mut documents {
            let Some(id) = doc.identifier.clone() else {
                continue;
            };
            let summary = summaries.get(&id);
            let abstract_text = abstracts.get(&id);
            if let Some(summary) = summary {
                apply_summary(doc, summary);
            }
            if let Some(text) = abstract_text {
                doc.metadata.abstract_text = Some(text.clone());
            }
            // Unknown to the service: keep the Phase 1 stage.
            if summary.is_some() || abstract_text.is_some() {
                doc.stage = EnrichmentStage::Full;
            }
        }

        documents
    }
}

fn identifiers_of(documents: &[EnrichedDocument]) -> Vec<String> {
    let ids: Vec<String> = documents
        .iter()
        .filter_map(|d| d.identifier.clone())
        .collect();
    dedup_identifiers(&ids)
}

/// Merge a summary into a document, leaving the Phase 1 citation count alone.
fn apply_summary(doc: &mut EnrichedDocument, summary: &ArticleSummary) {
    let metadata = &mut doc.metadata;
    metadata.title = summary.title.clone();
    metadata.journal = summary.journal.clone();
    metadata.publication_date = summary.publication_date.clone();
    metadata.article_types = summary.article_types.clone();
    metadata.doi = summary.doi.clone();
    metadata.authors = summary.authors.clone();
}
