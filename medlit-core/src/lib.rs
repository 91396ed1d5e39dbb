//! # Medlit Core
//!
//! Evidence retrieval-and-ranking pipeline for medical questions.
//! Provides scope classification, query rewriting, vector retrieval, the
//! two-phase enrichment funnel, quality re-ranking, evidence synthesis,
//! configuration, and the capability traits that keep the pipeline
//! independent of any particular LLM, index, or metadata service.

pub mod brain;
pub mod config;
pub mod error;
pub mod funnel;
pub mod metadata;
pub mod pipeline;
pub mod providers;
pub mod retrieval;
pub mod retry;
pub mod rewriter;
pub mod scope;
pub mod scoring;
pub mod synthesis;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, Classify, LlmProvider, MockLlmProvider, Rewrite, Synthesize};
pub use config::{MedlitConfig, RetryConfig, load_config};
pub use error::{
    ConfigError, LlmError, MedlitError, MetadataError, PipelineError, Result, RetrievalError,
};
pub use funnel::{EnrichmentFunnel, FunnelOutput, FunnelReport};
pub use metadata::{ArticleSummary, InMemoryMetadataSource, MetadataSource};
pub use pipeline::{Outcome, Pipeline, PipelineDeps, PipelineResponse, PipelineStage, SourceRef};
pub use retrieval::{HttpVectorIndex, StaticVectorSearch, VectorSearch};
pub use retry::{Transient, with_retry};
pub use rewriter::{QueryRewriter, RewriteOutcome};
pub use scope::{ScopeClassifier, ScopeDecision, ScopeTier};
pub use scoring::{ScoreWeights, quality_score, rerank};
pub use synthesis::{EvidenceSynthesizer, SynthesisOutcome};
pub use types::{BibliographicMetadata, Candidate, EnrichedDocument, EnrichmentStage};
