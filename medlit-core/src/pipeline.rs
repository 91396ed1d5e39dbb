//! Evidence pipeline state machine.
//!
//! ```text
//! ScopeClassify -> Reject                                  (terminal)
//!               -> QueryRewrite -> Retrieve -> NoResults   (terminal)
//!                                           -> Enrich -> Synthesize -> Done
//! ```
//!
//! Every stage runs at most once per request. Stages produce a
//! [`StageUpdate`]; [`RequestState::apply`] merges it into the one field that
//! stage owns and picks the next stage.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::brain::{Brain, Classify, Rewrite, Synthesize};
use crate::config::MedlitConfig;
use crate::error::PipelineError;
use crate::funnel::{EnrichmentFunnel, FunnelOutput, FunnelReport};
use crate::metadata::MetadataSource;
use crate::retrieval::VectorSearch;
use crate::rewriter::{QueryRewriter, RewriteOutcome};
use crate::scope::{ScopeClassifier, ScopeDecision};
use crate::synthesis::{EvidenceSynthesizer, SynthesisOutcome};
use crate::types::{Candidate, EnrichedDocument};

/// Returned when a question is out of scope.
pub const REJECTION_MESSAGE: &str = "I can only help with medical and health-related questions. Please ask a question about symptoms, conditions, treatments, or other medical topics.";

/// Returned when retrieval finds nothing.
pub const NO_RESULTS_MESSAGE: &str = "I couldn't find relevant medical literature for your question. Please try rephrasing it or consult a healthcare professional.";

/// A state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ScopeClassify,
    Reject,
    QueryRewrite,
    Retrieve,
    NoResults,
    Enrich,
    Synthesize,
    Done,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reject | Self::NoResults | Self::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScopeClassify => "scope_classify",
            Self::Reject => "reject",
            Self::QueryRewrite => "query_rewrite",
            Self::Retrieve => "retrieve",
            Self::NoResults => "no_results",
            Self::Enrich => "enrich",
            Self::Synthesize => "synthesize",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    Rejected,
    NoResults,
    SynthesisFallback,
}

/// The result of one non-terminal stage.
#[derive(Debug)]
pub enum StageUpdate {
    Scope(ScopeDecision),
    Rewrite(RewriteOutcome),
    Candidates(Vec<Candidate>),
    Enriched(FunnelOutput),
    Answer(SynthesisOutcome),
}

impl StageUpdate {
    /// The stage allowed to produce this update.
    fn producer(&self) -> PipelineStage {
        match self {
            Self::Scope(_) => PipelineStage::ScopeClassify,
            Self::Rewrite(_) => PipelineStage::QueryRewrite,
            Self::Candidates(_) => PipelineStage::Retrieve,
            Self::Enriched(_) => PipelineStage::Enrich,
            Self::Answer(_) => PipelineStage::Synthesize,
        }
    }
}

/// Request-scoped context threaded through the state machine.
#[derive(Debug)]
pub struct RequestState {
    pub id: Uuid,
    pub query: String,
    pub scope: Option<ScopeDecision>,
    pub rewrite: Option<RewriteOutcome>,
    pub candidates: Vec<Candidate>,
    pub documents: Vec<EnrichedDocument>,
    pub funnel: Option<FunnelReport>,
    pub answer: Option<SynthesisOutcome>,
    pub stage: PipelineStage,
    pub trace: Vec<PipelineStage>,
}

impl RequestState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            scope: None,
            rewrite: None,
            candidates: Vec::new(),
            documents: Vec::new(),
            funnel: None,
            answer: None,
            stage: PipelineStage::ScopeClassify,
            trace: vec![PipelineStage::ScopeClassify],
        }
    }

    /// Merge a stage's update and move to the next stage.
    ///
    /// # Panics
    ///
    /// If the update was not produced by the current stage. The pipeline
    /// never does this; it marks a programming error, not a runtime failure.
    pub fn apply(&mut self, update: StageUpdate) -> PipelineStage {
        assert_eq!(
            update.producer(),
            self.stage,
            "stage update applied out of order"
        );
        let next = match update {
            StageUpdate::Scope(decision) => {
                let next = if decision.is_medical {
                    PipelineStage::QueryRewrite
                } else {
                    PipelineStage::Reject
                };
                self.scope = Some(decision);
                next
            }
            StageUpdate::Rewrite(outcome) => {
                self.rewrite = Some(outcome);
                PipelineStage::Retrieve
            }
            StageUpdate::Candidates(candidates) => {
                let next = if candidates.is_empty() {
                    PipelineStage::NoResults
                } else {
                    PipelineStage::Enrich
                };
                self.candidates = candidates;
                next
            }
            StageUpdate::Enriched(output) => {
                self.documents = output.documents;
                self.funnel = Some(output.report);
                PipelineStage::Synthesize
            }
            StageUpdate::Answer(outcome) => {
                self.answer = Some(outcome);
                PipelineStage::Done
            }
        };
        self.stage = next;
        self.trace.push(next);
        info!(stage = %next, "Pipeline stage");
        next
    }

    /// The query sent to retrieval: the rewrite if there is one.
    pub fn retrieval_query(&self) -> &str {
        self.rewrite
            .as_ref()
            .map(|r| r.query.as_str())
            .unwrap_or(&self.query)
    }

    /// Build the response for a request that reached a terminal stage.
    pub fn into_response(self) -> PipelineResponse {
        let (answer, outcome) = match self.stage {
            PipelineStage::Reject => (REJECTION_MESSAGE.to_string(), Outcome::Rejected),
            PipelineStage::NoResults => (NO_RESULTS_MESSAGE.to_string(), Outcome::NoResults),
            _ => match self.answer {
                Some(SynthesisOutcome {
                    text,
                    fallback_used: false,
                }) => (text, Outcome::Answered),
                Some(SynthesisOutcome { text, .. }) => (text, Outcome::SynthesisFallback),
                None => (
                    crate::synthesis::SYNTHESIS_FALLBACK_MESSAGE.to_string(),
                    Outcome::SynthesisFallback,
                ),
            },
        };

        let sources = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| SourceRef::from_document(i + 1, doc))
            .collect();

        PipelineResponse {
            request_id: self.id,
            query: self.query,
            answer,
            outcome,
            scope: self.scope,
            rewritten_query: self.rewrite,
            funnel: self.funnel,
            sources,
            stages: self.trace,
        }
    }
}

/// One piece of evidence behind an answer, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub rank: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    pub citation_count: u64,
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SourceRef {
    pub fn from_document(rank: usize, doc: &EnrichedDocument) -> Self {
        Self {
            rank,
            pmid: doc.identifier.clone(),
            title: doc.title().map(str::to_string),
            journal: doc.metadata.journal.clone(),
            year: doc.publication_year(),
            citation_count: doc.citation_count(),
            quality_score: doc.quality_score,
            url: doc
                .identifier
                .as_ref()
                .map(|id| format!("https://pubmed.ncbi.nlm.nih.gov/{id}/")),
        }
    }
}

/// The caller-facing result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub query: String,
    pub answer: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<RewriteOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funnel: Option<FunnelReport>,
    pub sources: Vec<SourceRef>,
    /// Stages visited, in order.
    pub stages: Vec<PipelineStage>,
}

impl PipelineResponse {
    /// The answer followed by a numbered references list.
    pub fn render_markdown(&self) -> String {
        let mut out = self.answer.clone();
        if self.sources.is_empty() {
            return out;
        }
        out.push_str("\n\n## References\n");
        for source in &self.sources {
            out.push_str(&format!(
                "\n{}. {}",
                source.rank,
                source.title.as_deref().unwrap_or("Untitled")
            ));
            if let Some(journal) = &source.journal {
                out.push_str(&format!(". *{journal}*"));
            }
            if let Some(year) = source.year {
                out.push_str(&format!(" ({year})"));
            }
            if let (Some(pmid), Some(url)) = (&source.pmid, &source.url) {
                out.push_str(&format!(". PMID: [{pmid}]({url})"));
            }
            if source.citation_count > 0 {
                out.push_str(&format!(". Cited by {}", source.citation_count));
            }
        }
        out.push('\n');
        out
    }
}

/// Collaborators injected into the pipeline at construction time.
#[derive(Clone)]
pub struct PipelineDeps {
    pub classifier: Arc<dyn Classify>,
    pub rewriter: Arc<dyn Rewrite>,
    pub synthesizer: Arc<dyn Synthesize>,
    pub search: Arc<dyn VectorSearch>,
    pub metadata: Arc<dyn MetadataSource>,
}

impl PipelineDeps {
    /// Use one [`Brain`] for all three language capabilities.
    pub fn from_brain(
        brain: Arc<Brain>,
        search: Arc<dyn VectorSearch>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        Self {
            classifier: brain.clone(),
            rewriter: brain.clone(),
            synthesizer: brain,
            search,
            metadata,
        }
    }
}

/// The evidence retrieval-and-ranking pipeline.
///
/// Holds only stateless service handles; one instance serves concurrent requests.
pub struct Pipeline {
    scope: ScopeClassifier,
    rewriter: QueryRewriter,
    search: Arc<dyn VectorSearch>,
    funnel: EnrichmentFunnel,
    synthesizer: EvidenceSynthesizer,
    retrieval_k: usize,
}

impl Pipeline {
    pub fn new(config: &MedlitConfig, deps: PipelineDeps) -> Self {
        Self {
            scope: ScopeClassifier::new(&config.scope, deps.classifier),
            rewriter: QueryRewriter::for_config(deps.rewriter, &config.llm),
            search: deps.search,
            funnel: EnrichmentFunnel::new(
                deps.metadata,
                config.funnel.clone(),
                config.scoring,
            ),
            synthesizer: EvidenceSynthesizer::new(deps.synthesizer),
            retrieval_k: config.funnel.rerank_candidates,
        }
    }

    /// Run only the scope classification stage.
    pub async fn classify(&self, query: &str) -> Result<ScopeDecision, PipelineError> {
        self.scope
            .classify(query)
            .await
            .map_err(|source| PipelineError::Classification { source })
    }

    /// Answer a question.
    ///
    /// Only a failed delegated scope classification is returned as an error;
    /// every other failure degrades to a fallback inside the run.
    pub async fn run(&self, query: &str) -> Result<PipelineResponse, PipelineError> {
        let mut state = RequestState::new(query.trim());
        let span = info_span!("pipeline", request_id = %state.id);
        async move {
            info!(query = %state.query, "Pipeline started");
            while !state.stage.is_terminal() {
                let update = self.execute(&mut state).await?;
                state.apply(update);
            }
            let response = state.into_response();
            info!(outcome = ?response.outcome, sources = response.sources.len(), "Pipeline finished");
            Ok::<_, PipelineError>(response)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, state: &mut RequestState) -> Result<StageUpdate, PipelineError> {
        let update = match state.stage {
            PipelineStage::ScopeClassify => StageUpdate::Scope(self.classify(&state.query).await?),
            PipelineStage::QueryRewrite => {
                StageUpdate::Rewrite(self.rewriter.rewrite(&state.query).await)
            }
            PipelineStage::Retrieve => {
                let query = state.retrieval_query();
                let candidates = match self.search.search(query, self.retrieval_k).await {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        warn!(error = %e, "Retrieval failed; treating as no results");
                        Vec::new()
                    }
                };
                StageUpdate::Candidates(candidates)
            }
            PipelineStage::Enrich => {
                let candidates = std::mem::take(&mut state.candidates);
                StageUpdate::Enriched(self.funnel.enrich(candidates).await)
            }
            PipelineStage::Synthesize => StageUpdate::Answer(
                self.synthesizer
                    .synthesize(&state.query, &state.documents)
                    .await,
            ),
            PipelineStage::Reject | PipelineStage::NoResults | PipelineStage::Done => {
                unreachable!("terminal stages are never executed")
            }
        };
        Ok(update)
    }
}
