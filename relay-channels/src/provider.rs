//! OpenAI-compatible chat completions backend.
//!
//! Speaks the `/v1/chat/completions` format, which most hosted and local
//! model servers accept.

use async_trait::async_trait;
use relay_common::config::LlmConfig;
use relay_session::{ChatMessage, Provider};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Error from a model backend call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{provider}:{model}] {message}")]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct CompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f64>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompatibleRequest<'a> {
    model: &'a str,
    messages: Vec<CompatibleMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct CompatibleMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponse {
    #[serde(default)]
    choices: Vec<CompatibleChoice>,
    #[serde(default)]
    usage: Option<CompatibleUsage>,
}

#[derive(Debug, Deserialize)]
struct CompatibleChoice {
    message: CompatibleResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl CompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            temperature: None,
            client,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            "openai",
            &config.base_url,
            config.api_key.clone(),
            config.model.clone(),
            Duration::from_secs(config.timeout_secs),
        )
        .with_temperature(config.temperature)
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn error(&self, message: impl Into<String>, status_code: Option<u16>) -> ProviderError {
        ProviderError {
            provider: self.name.clone(),
            model: self.model.clone(),
            message: message.into(),
            status_code,
        }
    }
}

#[async_trait]
impl Provider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String> {
        let start = Instant::now();

        let mut wire = Vec::with_capacity(messages.len() + 1);
        if let Some(sys) = system {
            wire.push(CompatibleMessage {
                role: "system",
                content: sys,
            });
        }
        wire.extend(messages.iter().map(|m| CompatibleMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let request = CompatibleRequest {
            model: &self.model,
            messages: wire,
            temperature: self.temperature,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {e}"), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self
                .error(format!("API error ({status}): {body}"), Some(status.as_u16()))
                .into());
        }

        let body: CompatibleResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Failed to parse response: {e}"), None))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.error("No choices in response", None))?;

        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| self.error("Empty completion", None))?;

        let (input_tokens, output_tokens) = body
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        tracing::debug!(
            provider = %self.name,
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            input_tokens,
            output_tokens,
            finish_reason = choice.finish_reason.as_deref().unwrap_or("unknown"),
            "Completion finished"
        );

        Ok(content)
    }
}
