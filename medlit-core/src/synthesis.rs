//! Evidence synthesis prompt construction and fallback handling.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::brain::Synthesize;
use crate::types::{EnrichedDocument, EnrichmentStage};

/// Returned in place of an answer when the synthesis capability fails.
pub const SYNTHESIS_FALLBACK_MESSAGE: &str = "I found relevant medical literature but was unable to generate a summary at this time. Please consult the listed sources or a healthcare professional.";

/// Longest evidence excerpt placed in the prompt, in characters.
pub const MAX_EVIDENCE_CHARS: usize = 1_500;

const SYSTEM_PROMPT: &str = "You are a medical literature assistant. You answer health questions using only the numbered evidence provided by the user.

Guidelines:
- Base every statement on the evidence. If the evidence does not answer the question, say so plainly.
- Cite sources inline with their bracketed number, e.g. [1] or [2][3].
- Note the strength of the evidence: study type, size, and how widely it is cited.
- Write for a general audience. Explain technical terms briefly.
- Do not diagnose the user or prescribe treatment.
- End by recommending that the user discuss their situation with a qualified healthcare professional.";

/// The synthesized answer, or the fixed fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOutcome {
    pub text: String,
    pub fallback_used: bool,
}

/// Builds the evidence prompt and calls the [`Synthesize`] capability.
pub struct EvidenceSynthesizer {
    synthesizer: Arc<dyn Synthesize>,
}

impl EvidenceSynthesizer {
    pub fn new(synthesizer: Arc<dyn Synthesize>) -> Self {
        Self { synthesizer }
    }

    pub fn build_system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    /// The question followed by one numbered block per document, in rank order.
    pub fn build_user_prompt(&self, query: &str, documents: &[EnrichedDocument]) -> String {
        let mut prompt = format!("Question: {query}\n\nEvidence:\n");
        for (index, doc) in documents.iter().enumerate() {
            prompt.push('\n');
            write_evidence_block(&mut prompt, index + 1, doc);
        }
        prompt.push_str("\nAnswer the question using the evidence above, citing sources by number.");
        prompt
    }

    /// Synthesize an answer, substituting the fallback message on any failure.
    pub async fn synthesize(&self, query: &str, documents: &[EnrichedDocument]) -> SynthesisOutcome {
        let user_prompt = self.build_user_prompt(query, documents);
        debug!(
            documents = documents.len(),
            prompt_chars = user_prompt.len(),
            "Requesting synthesis"
        );
        match self
            .synthesizer
            .synthesize(self.build_system_prompt(), &user_prompt)
            .await
        {
            Ok(text) if !text.trim().is_empty() => SynthesisOutcome {
                text: text.trim().to_string(),
                fallback_used: false,
            },
            Ok(_) => {
                warn!("Synthesis returned empty text; using fallback message");
                fallback()
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed; using fallback message");
                fallback()
            }
        }
    }
}

fn fallback() -> SynthesisOutcome {
    SynthesisOutcome {
        text: SYNTHESIS_FALLBACK_MESSAGE.to_string(),
        fallback_used: true,
    }
}

fn write_evidence_block(out: &mut String, number: usize, doc: &EnrichedDocument) {
    let title = doc.title().unwrap_or("Untitled");
    let _ = writeln!(out, "[{number}] {title}");

    let meta = &doc.metadata;
    let mut details = Vec::new();
    if let Some(journal) = &meta.journal {
        details.push(format!("Journal: {journal}"));
    }
    if let Some(date) = meta
        .publication_date
        .as_deref()
        .or(doc.candidate.source.last_updated.as_deref())
    {
        details.push(format!("Published: {date}"));
    }
    if !meta.article_types.is_empty() {
        details.push(format!("Type: {}", meta.article_types.join(", ")));
    }
    if doc.stage != EnrichmentStage::None {
        details.push(format!("Citations: {}", meta.citation_count));
    }
    if !details.is_empty() {
        let _ = writeln!(out, "{}", details.join(" | "));
    }

    let mut ids = Vec::new();
    if let Some(id) = &doc.identifier {
        ids.push(format!("PMID: {id}"));
    }
    if let Some(doi) = &meta.doi {
        ids.push(format!("DOI: {doi}"));
    }
    if !ids.is_empty() {
        let _ = writeln!(out, "{}", ids.join(" | "));
    }

    let label = if meta.abstract_text.is_some() {
        "Abstract"
    } else {
        "Excerpt"
    };
    let _ = writeln!(
        out,
        "{label}: {}",
        truncate_chars(doc.evidence_text().trim(), MAX_EVIDENCE_CHARS)
    );
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
