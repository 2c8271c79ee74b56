//! Generative model gateway.
//!
//! The router only sees the [`GenerativeGateway`] trait. The bundled
//! implementation speaks the OpenAI-compatible chat-completions protocol,
//! which covers ChatGPT, DeepSeek, Kimi and Qwen's compatible mode.

pub mod openai;
pub mod prompt;

pub use openai::OpenAiCompatibleGateway;
pub use prompt::compose_system_prompt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConfigError, GenerativeError};
use crate::knowledge::{KnowledgeBase, KnowledgeMatcher};
use crate::store::Turn;

/// External text generator used for the generative fallback.
#[async_trait]
pub trait GenerativeGateway: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    /// Produce a reply to `text` given the recent conversation `context`
    /// (oldest turn first, not including `text` itself).
    async fn generate(&self, context: &[Turn], text: &str) -> Result<String, GenerativeError>;
}

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub base_url: String,
    pub model: String,
}

impl LlmConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Read `KF_ASSIST_LLM_*`. Returns `None` when no API key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("KF_ASSIST_LLM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        Some(Self {
            api_key: secrecy::SecretString::from(api_key),
            base_url: std::env::var("KF_ASSIST_LLM_BASE_URL")
                .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string()),
            model: std::env::var("KF_ASSIST_LLM_MODEL")
                .unwrap_or_else(|_| Self::DEFAULT_MODEL.to_string()),
        })
    }
}

/// Create a gateway from configuration, optionally with a composed system
/// prompt and knowledge entries quoted in it.
pub fn create_gateway(
    config: &LlmConfig,
    system_prompt: Option<String>,
    knowledge: Option<(Arc<KnowledgeBase>, KnowledgeMatcher)>,
) -> Result<Arc<dyn GenerativeGateway>, ConfigError> {
    if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
        return Err(ConfigError::InvalidValue {
            key: "KF_ASSIST_LLM_BASE_URL".into(),
            message: format!("not an http(s) URL: {}", config.base_url),
        });
    }
    tracing::info!("Using OpenAI-compatible gateway (model: {})", config.model);
    let mut gateway = OpenAiCompatibleGateway::new(config.clone());
    if let Some(prompt) = system_prompt {
        gateway = gateway.with_system_prompt(prompt);
    }
    let gateway: Arc<dyn GenerativeGateway> = match knowledge {
        Some((kb, matcher)) => Arc::new(gateway.with_knowledge(kb, matcher)),
        None => Arc::new(gateway),
    };
    Ok(gateway)
}
