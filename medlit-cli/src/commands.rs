//! Subcommand handlers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use medlit_core::config::to_toml;
use medlit_core::providers::create_provider;
use medlit_core::{
    Brain, Classify, HttpVectorIndex, LlmError, MedlitConfig, Pipeline, PipelineDeps,
    ScopeClassifier, ScopeDecision, ScopeTier,
};
use medlit_pubmed::PubMedClient;
use tracing::info;

use crate::{Commands, ConfigAction};

pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            question,
            top_k,
            candidates,
            json,
        } => {
            let mut config = load(workspace)?;
            if let Some(top_k) = top_k {
                config.funnel.top_k = top_k;
            }
            if let Some(candidates) = candidates {
                config.funnel.rerank_candidates = candidates;
            }
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            handle_ask(&question, &config, json).await
        }
        Commands::Classify { question } => {
            let config = load(workspace)?;
            handle_classify(&question, &config).await
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<MedlitConfig> {
    medlit_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn build_brain(config: &MedlitConfig) -> anyhow::Result<Arc<Brain>> {
    let provider = create_provider(&config.llm)
        .map_err(|e| anyhow::anyhow!("LLM provider error: {}", e))?;
    Ok(Arc::new(Brain::new(provider, &config.llm)))
}

async fn handle_ask(question: &str, config: &MedlitConfig, json: bool) -> anyhow::Result<()> {
    let brain = build_brain(config)?;
    let search = HttpVectorIndex::new(&config.retrieval)
        .map_err(|e| anyhow::anyhow!("Vector index error: {}", e))?;
    let metadata = PubMedClient::new(&config.metadata)
        .map_err(|e| anyhow::anyhow!("Metadata client error: {}", e))?;

    let pipeline = Pipeline::new(
        config,
        PipelineDeps::from_brain(brain, Arc::new(search), Arc::new(metadata)),
    );
    let response = pipeline.run(question).await?;
    info!(
        outcome = ?response.outcome,
        sources = response.sources.len(),
        "Question answered"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.render_markdown());
    }
    Ok(())
}

async fn handle_classify(question: &str, config: &MedlitConfig) -> anyhow::Result<()> {
    let decision = classify(question, config).await?;
    println!("{}", describe_decision(&decision));
    Ok(())
}

/// Settle on the term lists when possible, so lexical decisions need no LLM.
async fn classify(question: &str, config: &MedlitConfig) -> anyhow::Result<ScopeDecision> {
    let lexical = ScopeClassifier::new(&config.scope, Arc::new(NoClassifier));
    if let Some(decision) = lexical.lexical_decision(question) {
        return Ok(decision);
    }
    let classifier = ScopeClassifier::new(&config.scope, build_brain(config)?);
    classifier
        .classify(question)
        .await
        .map_err(|e| anyhow::anyhow!("Scope classification failed: {}", e))
}

fn describe_decision(decision: &ScopeDecision) -> String {
    let verdict = if decision.is_medical {
        "medical"
    } else {
        "not medical"
    };
    match (decision.tier, &decision.matched_term) {
        (ScopeTier::Classifier, _) => format!("{verdict} (decided by the language model)"),
        (_, Some(term)) => format!("{verdict} (matched term '{term}')"),
        (_, None) => verdict.to_string(),
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", to_toml(&config)?);
            Ok(())
        }
    }
}

/// Stand-in used only to reach the lexical tiers.
struct NoClassifier;

#[async_trait]
impl Classify for NoClassifier {
    async fn classify(&self, _prompt: &str) -> Result<bool, LlmError> {
        Err(LlmError::ApiRequest {
            message: "no classifier configured".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_show() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        assert!(handle_command(command, dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_workspace_config_is_layered() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".medlit");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[funnel]\ntop_k = 3\nrerank_candidates = 12\n",
        )
        .unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.funnel.top_k, 3);
        assert_eq!(config.funnel.rerank_candidates, 12);
    }

    #[tokio::test]
    async fn test_classify_lexical_needs_no_provider() {
        let mut config = MedlitConfig::default();
        // An unusable provider proves the model is never consulted.
        config.llm.provider = "openai".into();
        config.llm.api_key = None;
        config.llm.api_key_env = "MEDLIT_TEST_KEY_THAT_IS_NEVER_SET".into();
        config.llm.base_url = Some("https://unreachable.invalid/v1".into());

        let decision = classify("what's the weather tomorrow", &config).await.unwrap();
        assert!(!decision.is_medical);
        assert_eq!(decision.tier, ScopeTier::NonMedicalTerm);
        assert_eq!(
            describe_decision(&decision),
            "not medical (matched term 'weather')"
        );
    }

    #[tokio::test]
    async fn test_classify_falls_back_to_model() {
        let mut config = MedlitConfig::default();
        config.llm.provider = "openai".into();
        config.llm.api_key = None;
        config.llm.api_key_env = "MEDLIT_TEST_KEY_THAT_IS_NEVER_SET".into();
        config.llm.base_url = Some("https://unreachable.invalid/v1".into());

        // No lexical match and no credentials: the error surfaces.
        let err = classify("I feel tired all the time", &config).await.unwrap_err();
        assert!(err.to_string().contains("LLM provider error"));
    }

    #[test]
    fn test_describe_classifier_decision() {
        let decision = ScopeDecision {
            is_medical: true,
            tier: ScopeTier::Classifier,
            matched_term: None,
        };
        assert_eq!(
            describe_decision(&decision),
            "medical (decided by the language model)"
        );
    }
}
