//! Text generation over a local Ollama-style HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use herald_router::{LlmError, TextGenerator};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Calls `POST {base_url}/api/generate` without streaming.
pub struct HttpGenerator {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn request<'a>(&'a self, prompt: &'a str, system_hint: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: 0.7,
                top_p: 0.9,
            },
            system: (!system_hint.is_empty()).then_some(system_hint),
        }
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str, system_hint: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .json(&self.request(prompt, system_hint))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    LlmError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("HTTP {}: {}", status, body)));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        let text = body.response.trim().to_string();
        debug!(model = %self.model, chars = text.len(), "Generation complete");
        if text.is_empty() {
            return Err(LlmError::Malformed("empty response".into()));
        }
        Ok(text)
    }
}
