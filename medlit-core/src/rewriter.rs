//! Query rewriting for retrieval.
//!
//! Turns a conversational question into a dense search query. Any failure
//! falls back to the original text; rewriting can never block a request.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::brain::Rewrite;
use crate::config::LlmConfig;
use crate::retry::retry_budget;

const REWRITE_PROMPT: &str = "Rewrite the following patient question as a search query for a biomedical literature index.

Rules:
- Remove conversational filler and personal narrative.
- Expand medical abbreviations (e.g. \"MI\" -> \"myocardial infarction\").
- Add common synonymous medical terms.
- Keep every symptom term the user mentioned.
- Return only the rewritten query, on one line, with no explanation.

Question: ";

/// The query handed to retrieval, and whether it is the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub query: String,
    pub fallback_used: bool,
}

/// Delegates query rewriting to the [`Rewrite`] capability.
pub struct QueryRewriter {
    rewriter: Arc<dyn Rewrite>,
    timeout: Duration,
}

impl QueryRewriter {
    pub fn new(rewriter: Arc<dyn Rewrite>, timeout: Duration) -> Self {
        Self { rewriter, timeout }
    }

    /// Deadline long enough for every retry of the per-call LLM timeout.
    pub fn for_config(rewriter: Arc<dyn Rewrite>, llm: &LlmConfig) -> Self {
        let per_call = Duration::from_secs(llm.timeout_secs);
        Self::new(rewriter, retry_budget(&llm.retry, per_call))
    }

    /// Rewrite `original`, or return it unchanged with `fallback_used` set.
    pub async fn rewrite(&self, original: &str) -> RewriteOutcome {
        let prompt = format!("{REWRITE_PROMPT}{original}");
        let result = tokio::time::timeout(self.timeout, self.rewriter.rewrite(&prompt)).await;

        let failure = match result {
            Ok(Ok(text)) => match clean_rewrite(&text) {
                Some(query) => {
                    debug!(original = %original, rewritten = %query, "Query rewritten");
                    return RewriteOutcome {
                        query,
                        fallback_used: false,
                    };
                }
                None => "empty rewrite".to_string(),
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };

        warn!(error = %failure, "Query rewrite failed; using original query");
        RewriteOutcome {
            query: original.to_string(),
            fallback_used: true,
        }
    }
}

/// Strip labels and wrapping quotes models like to add; `None` if nothing is left.
fn clean_rewrite(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = ["search query:", "query:", "rewritten query:"]
        .iter()
        .find_map(|label| {
            line.get(..label.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(label))
                .map(|_| &line[label.len()..])
        })
        .unwrap_or(line);
    let cleaned = line.trim().trim_matches(['"', '\'', '`']).trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}
