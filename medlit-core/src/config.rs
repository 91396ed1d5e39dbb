//! Configuration system for Medlit.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/medlit/config.toml` and/or `.medlit/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConfigError, MedlitError};
use crate::scoring::ScoreWeights;

/// Top-level configuration for the evidence pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedlitConfig {
    #[serde(default)]
    pub funnel: FunnelConfig,
    #[serde(default)]
    pub scoring: ScoreWeights,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
}

/// Width and depth of the enrichment funnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// How many retrieved candidates enter Phase 1 (cheap citation fetch).
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    /// How many documents survive the re-rank and receive full metadata.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_rerank_candidates() -> usize {
    20
}

fn default_top_k() -> usize {
    5
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            rerank_candidates: default_rerank_candidates(),
            top_k: default_top_k(),
        }
    }
}

/// Retry policy applied to every external network call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Configuration for the bibliographic metadata service (NCBI E-utilities).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_base_url")]
    pub base_url: String,
    /// Environment variable holding the optional NCBI API key.
    #[serde(default = "default_metadata_api_key_env")]
    pub api_key_env: String,
    /// Contact address sent with every request, as NCBI asks of API users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_metadata_tool")]
    pub tool: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_metadata_base_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".into()
}

fn default_metadata_api_key_env() -> String {
    "NCBI_API_KEY".into()
}

fn default_metadata_tool() -> String {
    "medlit".into()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: default_metadata_base_url(),
            api_key_env: default_metadata_api_key_env(),
            email: None,
            tool: default_metadata_tool(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Configuration for the LLM provider backing classification, rewriting and synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name. Only OpenAI-compatible endpoints are built in.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    /// Inline API key. Takes precedence over `api_key_env`; never serialized.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Base URL override (Azure, Ollama, vLLM, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_llm_provider() -> String {
    "openai".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> usize {
    1024
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            api_key: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Configuration for query embedding and the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Index host, e.g. `https://medlit-abc123.svc.pinecone.io`.
    #[serde(default)]
    pub index_url: String,
    #[serde(default = "default_index_api_key_env")]
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_base_url")]
    pub embedding_base_url: String,
    #[serde(default = "default_llm_api_key_env")]
    pub embedding_api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_index_api_key_env() -> String {
    "PINECONE_API_KEY".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_url: String::new(),
            api_key_env: default_index_api_key_env(),
            namespace: None,
            embedding_model: default_embedding_model(),
            embedding_base_url: default_embedding_base_url(),
            embedding_api_key_env: default_llm_api_key_env(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Term lists for the lexical tier of scope classification.
///
/// Matching is case-insensitive substring matching in list order; the
/// medical list is always consulted before the non-medical list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default = "default_medical_terms")]
    pub medical_terms: Vec<String>,
    #[serde(default = "default_non_medical_terms")]
    pub non_medical_terms: Vec<String>,
}

fn default_medical_terms() -> Vec<String> {
    [
        "symptom",
        "disease",
        "diagnos",
        "treatment",
        "therapy",
        "medication",
        "medicine",
        "drug",
        "dose",
        "side effect",
        "doctor",
        "physician",
        "hospital",
        "patient",
        "clinical",
        "surgery",
        "infection",
        "virus",
        "bacteria",
        "vaccine",
        "cancer",
        "tumor",
        "diabetes",
        "insulin",
        "blood pressure",
        "hypertension",
        "cholesterol",
        "heart attack",
        "stroke",
        "asthma",
        "allergy",
        "migraine",
        "headache",
        "fever",
        "nausea",
        "pain",
        "fatigue",
        "depression",
        "anxiety",
        "pregnan",
        "syndrome",
        "disorder",
        "chronic",
        "prescription",
        "antibiotic",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_non_medical_terms() -> Vec<String> {
    [
        "weather",
        "stock market",
        "bitcoin",
        "recipe",
        "movie",
        "football",
        "basketball",
        "soccer",
        "video game",
        "programming",
        "javascript",
        "python",
        "restaurant",
        "vacation",
        "flight",
        "celebrity",
        "election",
        "lyrics",
        "homework",
        "real estate",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            medical_terms: default_medical_terms(),
            non_medical_terms: default_non_medical_terms(),
        }
    }
}

impl MedlitConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.funnel.top_k == 0 {
            return Err(ConfigError::Invalid {
                message: "funnel.top_k must be at least 1".into(),
            });
        }
        if self.funnel.rerank_candidates < self.funnel.top_k {
            return Err(ConfigError::Invalid {
                message: format!(
                    "funnel.rerank_candidates ({}) must be >= funnel.top_k ({})",
                    self.funnel.rerank_candidates, self.funnel.top_k
                ),
            });
        }
        let weights = &self.scoring;
        if weights.vector_weight < 0.0 || weights.citation_weight < 0.0 {
            return Err(ConfigError::Invalid {
                message: "scoring weights must be non-negative".into(),
            });
        }
        if weights.vector_weight + weights.citation_weight <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "at least one scoring weight must be positive".into(),
            });
        }
        for (name, secs) in [
            ("metadata.timeout_secs", self.metadata.timeout_secs),
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("retrieval.timeout_secs", self.retrieval.timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `MEDLIT_`)
/// 3. Workspace-local config (`.medlit/config.toml`)
/// 4. User config (`~/.config/medlit/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&MedlitConfig>,
) -> crate::error::Result<MedlitConfig> {
    let mut figment = Figment::from(Serialized::defaults(MedlitConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "medlit", "medlit") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".medlit").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // MEDLIT_FUNNEL__TOP_K, MEDLIT_LLM__MODEL, ...
    figment = figment.merge(Env::prefixed("MEDLIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| {
        MedlitError::Config(ConfigError::ParseError {
            message: e.to_string(),
        })
    })
}

/// Render the effective configuration as TOML.
pub fn to_toml(config: &MedlitConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
