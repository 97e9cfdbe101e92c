//! Completion clients used by the agent stages.
//!
//! A stage configured with `api_base` and `api_key` talks to an
//! OpenAI-compatible `/chat/completions` endpoint. Anything else gets the demo
//! client, which echoes the prompt as plain text so every stage falls through
//! to its default policy.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::StageSettings;

const DEFAULT_MODEL: &str = "default";
const DEMO_ECHO_CHARS: usize = 260;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one system + user exchange and return the raw reply text.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    fn is_demo(&self) -> bool {
        false
    }
}

/// Pick the client for a stage's settings.
pub fn completion_client(settings: &StageSettings, http: &reqwest::Client) -> Arc<dyn CompletionClient> {
    match (&settings.api_base, &settings.api_key) {
        (Some(api_base), Some(api_key)) if settings.is_live() => Arc::new(HttpCompletionClient {
            http: http.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            model: settings
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }),
        _ => Arc::new(DemoCompletion),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpCompletionClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let resp: ChatResponse = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send completion request to {}", url))?
            .error_for_status()
            .context("Completion endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse completion response")?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("Completion response had no content")
    }
}

/// Offline stand-in that echoes the start of the prompt.
pub struct DemoCompletion;

#[async_trait]
impl CompletionClient for DemoCompletion {
    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let echo: String = user.chars().take(DEMO_ECHO_CHARS).collect();
        Ok(format!("[demo {}] {}", &id[..6], echo))
    }

    fn is_demo(&self) -> bool {
        true
    }
}

/// A completion reply: the expected JSON shape, or the raw text when the
/// upstream did not produce it.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamReply<T> {
    Structured(T),
    Text(String),
}

impl<T: DeserializeOwned> UpstreamReply<T> {
    pub fn parse(raw: &str) -> Self {
        // Models often wrap JSON in prose or code fences.
        let cleaned = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if start < end => &raw[start..=end],
            _ => raw,
        };
        match serde_json::from_str(cleaned) {
            Ok(value) => Self::Structured(value),
            Err(_) => Self::Text(raw.trim().to_string()),
        }
    }

    pub fn structured(self) -> Option<T> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}
