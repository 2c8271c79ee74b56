//! OpenAI-compatible chat-completions client.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GenerativeError;
use crate::knowledge::{KnowledgeBase, KnowledgeMatcher};
use crate::llm::prompt::PLAIN_TEXT_ONLY;
use crate::llm::{GenerativeGateway, LlmConfig};
use crate::store::{Role, Turn};

const DEFAULT_SYSTEM_PROMPT: &str = "你是专业私域客服助手，请根据规则给出简洁、自然、可执行回复。";

const TEMPERATURE: f32 = 0.2;
const MAX_TOKENS: u32 = 500;

/// Knowledge entries quoted in the system prompt.
const REFERENCE_ENTRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Gateway for any `/chat/completions` endpoint.
pub struct OpenAiCompatibleGateway {
    config: LlmConfig,
    client: reqwest::Client,
    system_prompt: String,
    knowledge: Option<(Arc<KnowledgeBase>, KnowledgeMatcher)>,
}

impl OpenAiCompatibleGateway {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            knowledge: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.trim().is_empty() {
            self.system_prompt = prompt;
        }
        self
    }

    /// Quote the closest knowledge entries in the system prompt.
    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeBase>, matcher: KnowledgeMatcher) -> Self {
        self.knowledge = Some((knowledge, matcher));
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn reference_for(&self, text: &str) -> Vec<(String, String)> {
        let Some((knowledge, matcher)) = &self.knowledge else {
            return Vec::new();
        };
        let snapshot = knowledge.snapshot();
        matcher
            .top(&snapshot, text, REFERENCE_ENTRIES)
            .into_iter()
            .map(|(entry, _)| (entry.triggers.join(" / "), entry.reply_text.clone()))
            .collect()
    }

    fn provider_error(&self, reason: impl Into<String>) -> GenerativeError {
        GenerativeError::ProviderError {
            provider: self.config.model.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GenerativeGateway for OpenAiCompatibleGateway {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, context: &[Turn], text: &str) -> Result<String, GenerativeError> {
        let reference = self.reference_for(text);
        let request = ChatRequest {
            model: &self.config.model,
            messages: build_messages(&self.system_prompt, &reference, context, text),
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        debug!(
            model = %self.config.model,
            context_turns = context.len(),
            reference = reference.len(),
            "Calling generative gateway"
        );

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.provider_error(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerativeError::RateLimited {
                provider: self.config.model.clone(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.provider_error(format!("HTTP {status}: {}", truncate(&body, 200))));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| self.provider_error(format!("invalid response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| self.provider_error("response has no choices"))
    }
}

/// System prompt, optional knowledge reference and the plain-text rule,
/// then history and the new text.
pub(crate) fn build_messages(
    system_prompt: &str,
    reference: &[(String, String)],
    context: &[Turn],
    text: &str,
) -> Vec<ChatMessage> {
    let mut system = system_prompt.to_string();
    if !reference.is_empty() {
        system.push_str("\n\n【知识库参考】");
        for (question, answer) in reference {
            system.push_str(&format!("\n- 问：{question}\n  答：{answer}"));
        }
    }
    system.push_str("\n\n");
    system.push_str(PLAIN_TEXT_ONLY);

    let mut messages = Vec::with_capacity(context.len() + 2);
    messages.push(ChatMessage {
        role: "system",
        content: system,
    });
    for turn in context {
        messages.push(ChatMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Agent => "assistant",
            },
            content: turn.text.clone(),
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: text.to_string(),
    });
    messages
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
