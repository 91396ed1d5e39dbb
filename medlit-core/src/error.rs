//! Error types for the Medlit core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering LLM capabilities, bibliographic metadata, vector retrieval,
//! configuration, and the pipeline itself.

/// Top-level error type for the Medlit core library.
#[derive(Debug, thiserror::Error)]
pub enum MedlitError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from the bibliographic metadata service.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata request failed: {message}")]
    Request { message: String },

    #[error("Metadata request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Metadata service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Metadata response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Invalid metadata client configuration: {message}")]
    InvalidConfig { message: String },
}

/// Errors from embedding generation and vector search.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding request failed: {message}")]
    Embedding { message: String },

    #[error("Vector search failed: {message}")]
    Search { message: String },

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Vector search response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Vector search timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication failed for {service}")]
    AuthFailed { service: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors surfaced by the pipeline state machine.
///
/// Every other stage failure is recovered inside the pipeline; only a failed
/// delegated scope classification reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Scope classification failed: {source}")]
    Classification {
        #[source]
        source: LlmError,
    },
}

/// A type alias for results using the top-level `MedlitError`.
pub type Result<T> = std::result::Result<T, MedlitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = MedlitError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_metadata_status() {
        let err = MedlitError::Metadata(MetadataError::Status {
            status: 503,
            body: "Service Unavailable".into(),
        });
        assert_eq!(
            err.to_string(),
            "Metadata error: Metadata service returned status 503: Service Unavailable"
        );
    }

    #[test]
    fn test_error_display_pipeline() {
        let err = MedlitError::Pipeline(PipelineError::Classification {
            source: LlmError::Timeout { timeout_secs: 30 },
        });
        assert_eq!(
            err.to_string(),
            "Pipeline error: Scope classification failed: Request timed out after 30s"
        );
    }

    #[test]
    fn test_pipeline_error_exposes_source() {
        use std::error::Error;
        let err = PipelineError::Classification {
            source: LlmError::EmptyResponse,
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MedlitError = io_err.into();
        assert!(matches!(err, MedlitError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: MedlitError = serde_err.into();
        assert!(matches!(err, MedlitError::Serialization(_)));
    }

    #[test]
    fn test_retrieval_error_variants() {
        let err = RetrievalError::Timeout { timeout_secs: 10 };
        assert_eq!(err.to_string(), "Vector search timed out after 10s");

        let err = RetrievalError::AuthFailed {
            service: "vector index".into(),
        };
        assert_eq!(err.to_string(), "Authentication failed for vector index");
    }
}
