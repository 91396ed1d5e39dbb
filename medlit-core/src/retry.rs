//! Bounded retry with exponential backoff for external calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{LlmError, MetadataError, RetrievalError};

/// Classifies errors as transient (worth retrying) or permanent.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-requested delay before the next attempt, if any.
    fn retry_after_secs(&self) -> Option<u64> {
        None
    }
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. }
        )
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl Transient for MetadataError {
    fn is_transient(&self) -> bool {
        match self {
            MetadataError::Request { .. } | MetadataError::Timeout { .. } => true,
            MetadataError::Status { status, .. } => *status == 429 || *status >= 500,
            MetadataError::ResponseParse { .. } | MetadataError::InvalidConfig { .. } => false,
        }
    }
}

impl Transient for RetrievalError {
    fn is_transient(&self) -> bool {
        match self {
            RetrievalError::Embedding { .. }
            | RetrievalError::Search { .. }
            | RetrievalError::Timeout { .. } => true,
            RetrievalError::Status { status, .. } => *status == 429 || *status >= 500,
            RetrievalError::ResponseParse { .. } | RetrievalError::AuthFailed { .. } => false,
        }
    }
}

/// Execute an async operation, retrying transient failures with exponential backoff.
///
/// Makes at most `config.max_retries + 1` attempts. Permanent errors return
/// immediately; once retries are exhausted the last error is returned as-is.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Backoff for the given attempt, honouring any server retry-after.
///
/// A server-requested delay is still capped at `max_backoff_ms`.
fn compute_backoff<E: Transient>(config: &RetryConfig, attempt: u32, err: &E) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    match err.retry_after_secs() {
        Some(secs) => computed.max(secs.saturating_mul(1000).min(config.max_backoff_ms)),
        None => computed,
    }
}

/// Worst-case wall time of [`with_retry`] when each attempt is bounded by `per_attempt`.
pub fn retry_budget(config: &RetryConfig, per_attempt: Duration) -> Duration {
    let attempts = config.max_retries.saturating_add(1);
    // Capped delay plus the largest jitter.
    let max_delay_ms = config
        .max_backoff_ms
        .saturating_add(config.max_backoff_ms / 4);
    per_attempt.saturating_mul(attempts).saturating_add(Duration::from_millis(
        max_delay_ms.saturating_mul(u64::from(config.max_retries)),
    ))
}

/// `initial_backoff_ms * multiplier^attempt`, capped, with optional jitter.
pub fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}
