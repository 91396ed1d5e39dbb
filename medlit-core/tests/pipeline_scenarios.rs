//! End-to-end pipeline runs against fake capabilities and an in-memory
//! metadata source.

use async_trait::async_trait;
use medlit_core::config::MedlitConfig;
use medlit_core::metadata::MetadataOperation;
use medlit_core::pipeline::{NO_RESULTS_MESSAGE, REJECTION_MESSAGE};
use medlit_core::synthesis::SYNTHESIS_FALLBACK_MESSAGE;
use medlit_core::{
    ArticleSummary, Candidate, Classify, InMemoryMetadataSource, LlmError,
    Outcome, Pipeline, PipelineDeps, PipelineError, PipelineStage, Rewrite, ScopeTier,
    StaticVectorSearch, Synthesize,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

/// Fixed-response language capabilities. `None` means the call fails.
struct FakeLlm {
    classify: Option<bool>,
    rewrite: Option<&'static str>,
    synthesize: Option<&'static str>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeLlm {
    fn new() -> Self {
        Self {
            classify: Some(true),
            rewrite: Some("fatigue tiredness causes"),
            synthesize: Some("Fatigue has many causes, including anemia [1]."),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }
}

fn unavailable() -> LlmError {
    LlmError::Connection {
        message: "model unavailable".into(),
    }
}

#[async_trait]
impl Classify for FakeLlm {
    async fn classify(&self, _prompt: &str) -> Result<bool, LlmError> {
        self.record("classify");
        self.classify.ok_or_else(unavailable)
    }
}

#[async_trait]
impl Rewrite for FakeLlm {
    async fn rewrite(&self, _prompt: &str) -> Result<String, LlmError> {
        self.record("rewrite");
        self.rewrite.map(str::to_string).ok_or_else(unavailable)
    }
}

#[async_trait]
impl Synthesize for FakeLlm {
    async fn synthesize(&self, _system: &str, user: &str) -> Result<String, LlmError> {
        self.record("synthesize");
        assert!(user.contains("Evidence:"));
        self.synthesize.map(str::to_string).ok_or_else(unavailable)
    }
}

struct Harness {
    llm: Arc<FakeLlm>,
    search: Arc<StaticVectorSearch>,
    metadata: Arc<InMemoryMetadataSource>,
}

impl Harness {
    fn new(llm: FakeLlm, search: StaticVectorSearch, metadata: InMemoryMetadataSource) -> Self {
        Self {
            llm: Arc::new(llm),
            search: Arc::new(search),
            metadata: Arc::new(metadata),
        }
    }

    fn pipeline(&self) -> Pipeline {
        let deps = PipelineDeps {
            classifier: self.llm.clone(),
            rewriter: self.llm.clone(),
            synthesizer: self.llm.clone(),
            search: self.search.clone(),
            metadata: self.metadata.clone(),
        };
        Pipeline::new(&MedlitConfig::default(), deps)
    }
}

fn article(id: &str, title: &str) -> ArticleSummary {
    ArticleSummary {
        identifier: id.into(),
        title: Some(title.into()),
        journal: Some("Journal of Internal Medicine".into()),
        publication_date: Some("2021 Feb".into()),
        article_types: vec!["Journal Article".into()],
        ..Default::default()
    }
}

/// `count` candidates with similarity falling from 0.90 by 0.01.
fn ranked_candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            Candidate::new(format!("Excerpt {i} about fatigue."))
                .with_similarity(0.90 - i as f64 * 0.01)
        })
        .collect()
}

#[tokio::test]
async fn scenario_a_non_medical_term_rejects_before_retrieval() {
    let h = Harness::new(
        FakeLlm::new(),
        StaticVectorSearch::new(ranked_candidates(3)),
        InMemoryMetadataSource::new(),
    );
    let response = h.pipeline().run("What's the weather today?").await.unwrap();

    assert_eq!(response.outcome, Outcome::Rejected);
    assert_eq!(response.answer, REJECTION_MESSAGE);
    assert_eq!(
        response.stages,
        vec![PipelineStage::ScopeClassify, PipelineStage::Reject]
    );
    let scope = response.scope.unwrap();
    assert_eq!(scope.tier, ScopeTier::NonMedicalTerm);
    assert_eq!(scope.matched_term.as_deref(), Some("weather"));
    assert_eq!(h.search.call_count(), 0);
    assert!(h.llm.calls().is_empty());
}

#[tokio::test]
async fn scenario_b_unmatched_query_is_delegated_and_proceeds() {
    let h = Harness::new(
        FakeLlm::new(),
        StaticVectorSearch::new(ranked_candidates(3)),
        InMemoryMetadataSource::new(),
    );
    let response = h
        .pipeline()
        .run("I've been feeling really tired lately")
        .await
        .unwrap();

    assert_eq!(response.scope.unwrap().tier, ScopeTier::Classifier);
    assert_eq!(response.stages[1], PipelineStage::QueryRewrite);
    assert_eq!(h.llm.calls()[..2], ["classify", "rewrite"]);
    // Retrieval sees the rewritten query, synthesis the original.
    assert_eq!(
        h.search.last_query().as_deref(),
        Some("fatigue tiredness causes")
    );
    let rewrite = response.rewritten_query.unwrap();
    assert!(!rewrite.fallback_used);
    assert_eq!(response.outcome, Outcome::Answered);
}

#[tokio::test]
async fn classifier_failure_is_returned_to_caller() {
    let llm = FakeLlm {
        classify: None,
        ..FakeLlm::new()
    };
    let h = Harness::new(
        llm,
        StaticVectorSearch::new(ranked_candidates(3)),
        InMemoryMetadataSource::new(),
    );
    let result = h.pipeline().run("I've been feeling really tired lately").await;

    assert!(matches!(result, Err(PipelineError::Classification { .. })));
    assert_eq!(h.search.call_count(), 0);
}

#[tokio::test]
async fn scenario_c_zero_candidates_routes_to_no_results() {
    let h = Harness::new(
        FakeLlm::new(),
        StaticVectorSearch::new(Vec::new()),
        InMemoryMetadataSource::new(),
    );
    let response = h.pipeline().run("Is fever dangerous in adults?").await.unwrap();

    assert_eq!(response.outcome, Outcome::NoResults);
    assert_eq!(response.answer, NO_RESULTS_MESSAGE);
    assert_eq!(response.stages.last(), Some(&PipelineStage::NoResults));
    assert!(!response.stages.contains(&PipelineStage::Enrich));
    assert_eq!(h.metadata.calls(MetadataOperation::CitationCounts), 0);
    assert_eq!(h.metadata.calls(MetadataOperation::Resolve), 0);
    assert!(!h.llm.calls().contains(&"synthesize"));
}

#[tokio::test]
async fn retrieval_failure_routes_to_no_results() {
    let h = Harness::new(
        FakeLlm::new(),
        StaticVectorSearch::failing(),
        InMemoryMetadataSource::new(),
    );
    let response = h.pipeline().run("Is fever dangerous in adults?").await.unwrap();
    assert_eq!(response.outcome, Outcome::NoResults);
}

#[tokio::test]
async fn scenario_d_sparse_identifiers_still_yield_top_k() {
    let mut candidates = ranked_candidates(20);
    candidates[9] = candidates[9].clone().with_identifier("1001");
    candidates[14] = candidates[14].clone().with_identifier("1002");
    candidates[19] = candidates[19].clone().with_identifier("1003");

    let metadata = InMemoryMetadataSource::new()
        .with_article(article("1001", "Anemia and fatigue"), 200, Some("Anemia..."))
        .with_article(article("1002", "Thyroid disease"), 50, Some("Thyroid..."))
        .with_article(article("1003", "Sleep apnea"), 20, None);

    let h = Harness::new(FakeLlm::new(), StaticVectorSearch::new(candidates), metadata);
    let response = h.pipeline().run("What causes chronic fatigue?").await.unwrap();

    assert_eq!(response.outcome, Outcome::Answered);
    assert_eq!(response.sources.len(), 5);
    let pmids: Vec<Option<&str>> = response.sources.iter().map(|s| s.pmid.as_deref()).collect();
    assert_eq!(
        pmids,
        vec![Some("1001"), Some("1002"), Some("1003"), None, None]
    );
    assert!(
        response
            .sources
            .windows(2)
            .all(|w| w[0].quality_score >= w[1].quality_score)
    );

    let report = response.funnel.unwrap();
    assert_eq!(report.intake, 20);
    assert_eq!(report.identified, 3);
    assert_eq!(report.expensive_ids, 3);
    assert!(!report.citations_unavailable);

    // One citation call for the whole intake; detail calls only for the top 5.
    assert_eq!(h.metadata.calls(MetadataOperation::CitationCounts), 1);
    assert_eq!(h.metadata.calls(MetadataOperation::Summaries), 1);
    assert_eq!(h.metadata.calls(MetadataOperation::Abstracts), 1);
    assert_eq!(h.metadata.expensive_ids_requested(), 6);
}

#[tokio::test]
async fn scenario_e_detail_outage_forwards_citation_only_documents() {
    let candidates: Vec<Candidate> = ranked_candidates(8)
        .into_iter()
        .enumerate()
        .map(|(i, c)| c.with_identifier(format!("{}", 2000 + i)))
        .collect();
    let mut metadata = InMemoryMetadataSource::new();
    for i in 0..8u64 {
        metadata = metadata.with_article(
            article(&format!("{}", 2000 + i), "Fatigue study"),
            i * 3,
            Some("Abstract"),
        );
    }
    metadata.fail(MetadataOperation::Summaries);

    let h = Harness::new(FakeLlm::new(), StaticVectorSearch::new(candidates), metadata);
    let response = h.pipeline().run("What causes chronic fatigue?").await.unwrap();

    let report = response.funnel.clone().unwrap();
    assert!(report.details_unavailable);
    assert_eq!(response.sources.len(), 5);
    // Citation counts from Phase 1 survive; summaries never arrived.
    assert!(response.sources.iter().all(|s| s.journal.is_none()));
    assert!(response.sources.iter().any(|s| s.citation_count > 0));
    assert!(h.llm.calls().contains(&"synthesize"));
    assert_eq!(response.outcome, Outcome::Answered);
}

#[tokio::test]
async fn metadata_outage_degrades_to_minimal_documents() {
    let candidates: Vec<Candidate> = ranked_candidates(6)
        .into_iter()
        .enumerate()
        .map(|(i, c)| c.with_identifier(format!("{}", 3000 + i)))
        .collect();
    let metadata = InMemoryMetadataSource::new();
    metadata.fail(MetadataOperation::CitationCounts);
    metadata.fail(MetadataOperation::Summaries);
    metadata.fail(MetadataOperation::Abstracts);

    let h = Harness::new(FakeLlm::new(), StaticVectorSearch::new(candidates), metadata);
    let response = h.pipeline().run("Best treatment for migraine?").await.unwrap();

    assert_eq!(response.sources.len(), 5);
    // Ranking falls back to similarity order.
    let pmids: Vec<&str> = response
        .sources
        .iter()
        .filter_map(|s| s.pmid.as_deref())
        .collect();
    assert_eq!(pmids, vec!["3000", "3001", "3002", "3003", "3004"]);
    assert!(response.sources.iter().all(|s| s.citation_count == 0));
    assert_eq!(response.outcome, Outcome::Answered);
}

#[tokio::test]
async fn rewrite_failure_uses_original_query() {
    let llm = FakeLlm {
        rewrite: None,
        ..FakeLlm::new()
    };
    let h = Harness::new(
        llm,
        StaticVectorSearch::new(ranked_candidates(2)),
        InMemoryMetadataSource::new(),
    );
    let response = h.pipeline().run("  Is fever dangerous in adults?  ").await.unwrap();

    assert!(response.rewritten_query.unwrap().fallback_used);
    assert_eq!(
        h.search.last_query().as_deref(),
        Some("Is fever dangerous in adults?")
    );
    assert_eq!(response.outcome, Outcome::Answered);
}

#[tokio::test]
async fn synthesis_failure_returns_fallback_with_sources() {
    let llm = FakeLlm {
        synthesize: None,
        ..FakeLlm::new()
    };
    let h = Harness::new(
        llm,
        StaticVectorSearch::new(ranked_candidates(2)),
        InMemoryMetadataSource::new(),
    );
    let response = h.pipeline().run("Is fever dangerous in adults?").await.unwrap();

    assert_eq!(response.outcome, Outcome::SynthesisFallback);
    assert_eq!(response.answer, SYNTHESIS_FALLBACK_MESSAGE);
    assert_eq!(response.sources.len(), 2);
    assert_eq!(response.stages.last(), Some(&PipelineStage::Done));
}

#[tokio::test]
async fn unidentified_documents_carry_default_metadata() {
    let h = Harness::new(
        FakeLlm::new(),
        StaticVectorSearch::new(ranked_candidates(3)),
        InMemoryMetadataSource::new(),
    );
    let pipeline = h.pipeline();
    let response = pipeline.run("Is fever dangerous in adults?").await.unwrap();
    assert_eq!(response.sources.len(), 3);
    assert!(response.sources.iter().all(|s| s.citation_count == 0 && s.pmid.is_none()));

    // Same pipeline, second request: nothing leaks between runs.
    let again = pipeline.run("Is fever dangerous in adults?").await.unwrap();
    assert_ne!(response.request_id, again.request_id);
    assert_eq!(again.sources.len(), 3);
}
