//! Language-model completion seam and its OpenRouter implementation.

use std::time::Duration;

use async_trait::async_trait;
use biothreat_shared::{AppConfig, ForecastError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Suffix appended to every system prompt; replies are parsed as JSON.
const JSON_ONLY: &str = "Respond ONLY with valid JSON. No markdown, no explanation.";

/// A single chat-style completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

/// Raw text returned by the model.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
}

/// Anything that can answer a [`CompletionRequest`].
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Identifier recorded as provenance on capabilities and mappings.
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// OpenRouter chat-completions client.
pub struct OpenRouterClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenRouterClient {
    /// Build a client from config and an already-validated API key.
    pub fn from_config(config: &AppConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("biothreat-forecaster/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.openrouter.timeout_secs))
            .build()
            .map_err(|e| ForecastError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.openrouter.base_url.trim_end_matches('/')
            ),
            api_key,
            model: config.openrouter.default_model.clone(),
            max_tokens: config.openrouter.max_tokens,
            temperature: config.openrouter.temperature,
        })
    }

    /// Use a different model than the configured default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let system = format!("{}\n\n{JSON_ONLY}", request.system);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!(model = %self.model, prompt_chars = request.prompt.len(), "completion request");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://biosecurity-forecaster.local")
            .header("X-Title", "Biosecurity Threat Forecaster")
            .json(&body)
            .send()
            .await
            .map_err(|e| ForecastError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ForecastError::Llm(format!("HTTP {status}: {message}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ForecastError::Llm(format!("invalid response body: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(ForecastError::Llm(err.message));
        }

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ForecastError::Llm("empty completion".into()))?;

        Ok(Completion { text })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Strip a Markdown code fence (```json ... ```) wrapped around a reply.
pub fn strip_json_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}
