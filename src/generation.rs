use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const COMPLETION_ENDPOINT: &str = "completion endpoint";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPrompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the text of the first choice.
    async fn complete(&self, prompt: &CompletionPrompt) -> AppResult<String>;
}

/// OpenAI-compatible `chat/completions` client.
pub struct HttpCompletionClient {
    http: Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
    temperature: f32,
}

impl HttpCompletionClient {
    /// Fails with a configuration error when no API key is configured, before
    /// any request can be made.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.model_api_key.clone().ok_or_else(|| {
            AppError::Config("MODEL_API_KEY is not set; cannot call the completion endpoint".into())
        })?;
        let http = Client::builder()
            .user_agent(concat!("place-curator/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.model_api_base),
            api_key,
            model: config.model_name.clone(),
            temperature: config.model_temperature,
        })
    }

    pub fn into_shared(self) -> Arc<dyn CompletionClient> {
        Arc::new(self)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &CompletionPrompt) -> AppResult<String> {
        let started = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = api_error_message(&text);
            warn!(status = status.as_u16(), %message, "completion request rejected");
            return Err(AppError::Api {
                endpoint: COMPLETION_ENDPOINT,
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        debug!(
            model = %self.model,
            duration_ms = started.elapsed().as_millis() as u64,
            "completion received"
        );

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Api {
                endpoint: COMPLETION_ENDPOINT,
                status: status.as_u16(),
                message: "response carried no choices".into(),
            })
    }
}

/// Pulls the machine-readable message out of an error body, accepting the
/// `{"error": {"message": ..}}`, `{"error": ".."}` and `{"message": ..}`
/// shapes. Falls back to the raw body.
pub(crate) fn api_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let structured = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("error").filter(|v| v.is_string()))
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    structured.unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            "no error body".to_string()
        } else {
            trimmed.chars().take(300).collect()
        }
    })
}
