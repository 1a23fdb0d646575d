use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use common::{ChatMessage, ChatRole, Error, Reasoner, ReasonerConfig, Result};

/// Reasoner backed by an OpenAI-compatible chat-completions endpoint.
pub struct HttpReasoner {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl HttpReasoner {
    pub fn new(config: &ReasonerConfig, api_key: impl Into<String>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_sec))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                }))
                .collect::<Vec<_>>(),
        });

        debug!(model = %self.model, messages = messages.len(), "reasoner request");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("reasoner: {e}"))
                } else {
                    Error::Network(format!("reasoner: {e}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited("reasoner throttled".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!("reasoner HTTP {status}: {body}")));
        }

        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("reasoner decode: {e}")))?;

        payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Network("reasoner returned no choices".into()))
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Canned reasoner for tests and offline runs. Returns queued responses
/// in order, then falls back to a fixed narrative.
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new(
            "Assessment:\n\
             - momentum indicators support the current reading\n\
             - order flow is broadly balanced at these levels\n\
             Bull case: continuation of the recent trend.\n\
             Bear case: reversal on macro headlines.",
        )
    }
}

impl ScriptedReasoner {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
        }
    }

    pub async fn queue(&self, response: impl Into<String>) {
        self.responses.lock().await.push_back(response.into());
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn generate(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok(self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
