//! Generation backend
//!
//! One client for the three provider families. The provider is fixed when the
//! client is built from configuration; requests never pick it.

pub mod protocol;

use crate::config::{BackendConfig, ProviderKind};
use crate::error::{NlqError, Result};
use crate::sql_guard::RawGenerationText;
use async_trait::async_trait;
use protocol::{Frame, LineBuffer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str =
    "You are the assistant of a school management system. Follow the instructions in the user message exactly.";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The two things the engine asks of a text generator.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One request, one complete answer.
    async fn generate(&self, prompt: &str) -> Result<RawGenerationText>;

    /// Sends text fragments to `tokens` in arrival order and returns the
    /// concatenation once the provider finishes. Dropping the receiver makes
    /// this return an error at the next fragment.
    async fn generate_streaming(&self, prompt: &str, tokens: mpsc::Sender<String>) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    provider: ProviderKind,
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        if config.provider == ProviderKind::Disabled {
            return Err(NlqError::Configuration(
                "generation backend is disabled".to_string(),
            ));
        }
        if config.api_key.is_empty() {
            return Err(NlqError::Configuration(format!(
                "no API key for provider {:?}",
                config.provider
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NlqError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider: config.provider,
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
            timeout: config.timeout,
        })
    }

    /// `None` when the provider is disabled.
    pub fn from_config(config: &BackendConfig) -> Result<Option<Arc<dyn GenerationBackend>>> {
        if config.provider == ProviderKind::Disabled {
            info!("Generation backend disabled; pattern fallback only");
            return Ok(None);
        }
        let client = Self::new(config)?;
        info!("Generation backend: {:?} ({})", client.provider, client.model);
        Ok(Some(Arc::new(client)))
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn endpoint(&self, stream: bool) -> String {
        match self.provider {
            ProviderKind::OpenAi => format!("{}/chat/completions", self.base_url),
            ProviderKind::Anthropic => format!("{}/messages", self.base_url),
            ProviderKind::Gemini if stream => format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, self.model
            ),
            ProviderKind::Gemini => format!("{}/models/{}:generateContent", self.base_url, self.model),
            ProviderKind::Disabled => String::new(),
        }
    }

    fn body(&self, prompt: &str, stream: bool) -> Value {
        match self.provider {
            ProviderKind::OpenAi => json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt}
                ],
                "temperature": 0.1,
                "max_tokens": self.max_tokens,
                "stream": stream,
            }),
            ProviderKind::Anthropic => json!({
                "model": self.model,
                "system": SYSTEM_PROMPT,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.1,
                "max_tokens": self.max_tokens,
                "stream": stream,
            }),
            ProviderKind::Gemini => json!({
                "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
                "contents": [{"role": "user", "parts": [{"text": prompt}]}],
                "generationConfig": {"temperature": 0.1, "maxOutputTokens": self.max_tokens},
            }),
            ProviderKind::Disabled => Value::Null,
        }
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(self.endpoint(stream))
            .header("Content-Type", "application/json")
            .json(&self.body(prompt, stream));
        match self.provider {
            ProviderKind::OpenAi => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            ProviderKind::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ProviderKind::Gemini => builder.header("x-goog-api-key", &self.api_key),
            ProviderKind::Disabled => builder,
        }
    }

    /// Send and fail on any non-success status, carrying the provider's detail.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                NlqError::Generation(format!(
                    "{:?} did not respond within {}s",
                    self.provider,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| NlqError::Generation(format!("{:?} request failed: {}", self.provider, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| protocol::error_message(&v))
            .unwrap_or_else(|| body.chars().take(300).collect());
        Err(NlqError::Generation(format!(
            "{:?} HTTP {}: {}",
            self.provider, status, detail
        )))
    }

    fn completion_text(&self, value: &Value) -> Option<String> {
        match self.provider {
            ProviderKind::OpenAi => value["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string),
            ProviderKind::Anthropic => value["content"].as_array().map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<String>()
            }),
            ProviderKind::Gemini => Some(protocol::candidate_text(value)),
            ProviderKind::Disabled => None,
        }
    }
}

#[async_trait]
impl GenerationBackend for LlmClient {
    fn name(&self) -> &str {
        match self.provider {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Disabled => "disabled",
        }
    }

    async fn generate(&self, prompt: &str) -> Result<RawGenerationText> {
        let request = self.request(prompt, false).timeout(self.timeout);
        let response = self.send(request).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| NlqError::Generation(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(message) = protocol::error_message(&value) {
            return Err(NlqError::Generation(message));
        }
        let text = self
            .completion_text(&value)
            .ok_or_else(|| NlqError::Generation("No content in LLM response".to_string()))?;
        debug!("{} returned {} characters", self.name(), text.len());
        Ok(RawGenerationText::new(text))
    }

    async fn generate_streaming(&self, prompt: &str, tokens: mpsc::Sender<String>) -> Result<String> {
        let mut response = self.send(self.request(prompt, true)).await?;
        let mut lines = LineBuffer::default();
        let mut text = String::new();

        loop {
            let chunk = tokio::time::timeout(self.timeout, response.chunk())
                .await
                .map_err(|_| {
                    NlqError::Generation(format!(
                        "{:?} stream stalled for {}s",
                        self.provider,
                        self.timeout.as_secs()
                    ))
                })?
                .map_err(|e| NlqError::Generation(format!("{:?} stream failed: {}", self.provider, e)))?;

            let Some(chunk) = chunk else {
                break;
            };
            for line in lines.push(&chunk) {
                if accept(self.provider, &line, &mut text, &tokens).await? {
                    return Ok(text);
                }
            }
        }

        if let Some(line) = lines.finish() {
            accept(self.provider, &line, &mut text, &tokens).await?;
        }
        Ok(text)
    }
}

/// Handle one line; `Ok(true)` once the provider signalled completion.
async fn accept(
    provider: ProviderKind,
    line: &str,
    text: &mut String,
    tokens: &mpsc::Sender<String>,
) -> Result<bool> {
    match protocol::parse_line(provider, line) {
        Frame::Delta(delta) => {
            text.push_str(&delta);
            tokens
                .send(delta)
                .await
                .map_err(|_| NlqError::Generation("token consumer went away".to_string()))?;
            Ok(false)
        }
        Frame::Done => Ok(true),
        Frame::Skip => Ok(false),
        Frame::Failed(message) => {
            warn!("{:?} stream error after {} characters: {}", provider, text.len(), message);
            Err(NlqError::Generation(message))
        }
    }
}
