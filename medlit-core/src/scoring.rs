//! Quality scoring. Blends retrieval similarity with citation impact.
//!
//! Citation counts are log-normalized against the batch maximum so a few
//! heavily cited outliers cannot swamp a batch of relevant, rarely cited
//! papers. Relevance carries most of the weight; citations break ties.

use serde::{Deserialize, Serialize};

use crate::types::EnrichedDocument;

/// Relative weights of the two ranking signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_citation_weight")]
    pub citation_weight: f64,
}

fn default_vector_weight() -> f64 {
    0.7
}

fn default_citation_weight() -> f64 {
    0.3
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            citation_weight: default_citation_weight(),
        }
    }
}

/// `ln(count + 1) / ln(max + 1)`, or `0` when the batch has no citations.
pub fn normalized_citations(citation_count: u64, max_citations: u64) -> f64 {
    if max_citations == 0 {
        return 0.0;
    }
    let numerator = (citation_count as f64 + 1.0).ln();
    let denominator = (max_citations as f64 + 1.0).ln();
    numerator / denominator
}

/// Blend similarity and normalized citations into one ranking score.
pub fn quality_score(
    vector_similarity: f64,
    citation_count: u64,
    max_citations: u64,
    weights: &ScoreWeights,
) -> f64 {
    vector_similarity * weights.vector_weight
        + normalized_citations(citation_count, max_citations) * weights.citation_weight
}

/// Score every document against the batch maximum, sort descending, keep `top_n`.
///
/// The sort is stable: equal scores keep their incoming (retrieval) order.
pub fn rerank(
    mut documents: Vec<EnrichedDocument>,
    weights: &ScoreWeights,
    top_n: usize,
) -> Vec<EnrichedDocument> {
    let max_citations = documents
        .iter()
        .map(EnrichedDocument::citation_count)
        .max()
        .unwrap_or(0);

    for doc in &mut documents {
        doc.quality_score = quality_score(
            doc.vector_similarity(),
            doc.citation_count(),
            max_citations,
            weights,
        );
    }

    documents.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
    documents.truncate(top_n);
    documents
}
