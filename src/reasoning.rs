//! Reasoning service client
//!
//! Thin client for an OpenAI-compatible chat-completions endpoint. The
//! daemon treats the service as an untrusted collaborator: every call
//! runs under a timeout, and callers parse the returned text strictly
//! (see `decision::parse_decision`). The `Reasoning` trait is the seam
//! the scheduler and consolidator depend on, so tests can substitute a
//! scripted implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::CompanionError;

/// Completion result with token usage for accounting
#[derive(Debug, Clone)]
pub struct ReasoningReply {
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Reasoning collaborator seam
#[async_trait]
pub trait Reasoning: Send + Sync {
    /// One chat completion. `purpose` tags the call for usage
    /// accounting (`think`, `extract`, `rebuild`).
    async fn complete(
        &self,
        purpose: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ReasoningReply, CompanionError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

/// HTTP reasoning client
pub struct HttpReasoning {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpReasoning {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
            model: model.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Reasoning for HttpReasoning {
    async fn complete(
        &self,
        purpose: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<ReasoningReply, CompanionError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature: 0.5,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).timeout(self.timeout).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CompanionError::ReasoningTimeout(self.timeout)
            } else {
                CompanionError::ReasoningUnavailable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(CompanionError::ReasoningUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompanionError::ProtocolViolation(format!("bad response body: {e}")))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                CompanionError::ProtocolViolation("response had no content".to_string())
            })?;

        debug!(
            purpose,
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            "reasoning call complete"
        );

        Ok(ReasoningReply {
            content,
            prompt_tokens: parsed.usage.prompt_tokens,
            completion_tokens: parsed.usage.completion_tokens,
        })
    }
}

/// Stand-in used when no reasoning endpoint is configured. The daemon
/// still observes and logs; every Think degrades to doing nothing.
pub struct UnconfiguredReasoning;

#[async_trait]
impl Reasoning for UnconfiguredReasoning {
    async fn complete(
        &self,
        _purpose: &str,
        _system: &str,
        _user: &str,
        _max_tokens: u32,
    ) -> Result<ReasoningReply, CompanionError> {
        Err(CompanionError::ReasoningUnavailable(
            "no reasoning endpoint configured".to_string(),
        ))
    }
}
