//! Scope classification: is this a medical question at all?
//!
//! Two tiers. The lexical tier scans the medical list, then the non-medical
//! list, with case-insensitive substring matching in list order; the first
//! hit decides. Only when neither list matches is the question delegated to
//! the [`Classify`] capability, whose answer is final.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::brain::Classify;
use crate::config::ScopeConfig;
use crate::error::LlmError;

const CLASSIFY_PROMPT: &str = "You are a triage assistant for a medical literature service.
Decide whether the user's message is a medical or health-related question: symptoms,
conditions, treatments, medications, prevention, diagnostics, or general health.

Answer with exactly one word: yes or no.

Message: ";

/// Which tier produced a scope decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeTier {
    MedicalTerm,
    NonMedicalTerm,
    Classifier,
}

/// The outcome of scope classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDecision {
    pub is_medical: bool,
    pub tier: ScopeTier,
    /// The list entry that matched, for lexical decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_term: Option<String>,
}

/// Two-tier medical scope classifier.
pub struct ScopeClassifier {
    medical_terms: Vec<String>,
    non_medical_terms: Vec<String>,
    classifier: Arc<dyn Classify>,
}

impl ScopeClassifier {
    pub fn new(config: &ScopeConfig, classifier: Arc<dyn Classify>) -> Self {
        let lower = |terms: &[String]| -> Vec<String> {
            terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            medical_terms: lower(&config.medical_terms),
            non_medical_terms: lower(&config.non_medical_terms),
            classifier,
        }
    }

    /// Lexical tier only. `None` means neither list matched.
    pub fn lexical_decision(&self, query: &str) -> Option<ScopeDecision> {
        let haystack = query.to_lowercase();
        if let Some(term) = first_match(&self.medical_terms, &haystack) {
            return Some(ScopeDecision {
                is_medical: true,
                tier: ScopeTier::MedicalTerm,
                matched_term: Some(term.to_string()),
            });
        }
        first_match(&self.non_medical_terms, &haystack).map(|term| ScopeDecision {
            is_medical: false,
            tier: ScopeTier::NonMedicalTerm,
            matched_term: Some(term.to_string()),
        })
    }

    /// Classify a query, delegating to the capability when no term matches.
    ///
    /// A capability failure is returned as-is; there is no default branch.
    pub async fn classify(&self, query: &str) -> Result<ScopeDecision, LlmError> {
        if let Some(decision) = self.lexical_decision(query) {
            debug!(
                is_medical = decision.is_medical,
                term = ?decision.matched_term,
                "Lexical scope decision"
            );
            return Ok(decision);
        }

        let prompt = format!("{CLASSIFY_PROMPT}{query}");
        let is_medical = self.classifier.classify(&prompt).await?;
        debug!(is_medical, "Delegated scope decision");
        Ok(ScopeDecision {
            is_medical,
            tier: ScopeTier::Classifier,
            matched_term: None,
        })
    }
}

fn first_match<'a>(terms: &'a [String], haystack: &str) -> Option<&'a str> {
    terms
        .iter()
        .find(|term| haystack.contains(term.as_str()))
        .map(String::as_str)
}
