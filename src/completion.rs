use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::CompletionSettings;
use crate::error::{RagError, Result};
use crate::models::{ChatResponse, Message};

/// A text-generation backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, messages: &[Message], temperature: f32) -> Result<String>;

    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpCompletionClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(settings: &CompletionSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| RagError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn transport_error(e: reqwest::Error) -> RagError {
    if e.is_connect() || e.is_timeout() {
        RagError::BackendUnavailable(format!("Completion backend unreachable: {}", e))
    } else {
        RagError::BackendError(format!("Completion request failed: {}", e))
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, messages: &[Message], temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionBody {
            model: &self.model,
            messages,
            temperature,
            stream: false,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::BackendError(format!(
                "Completion request failed: {} - {}",
                status, error_text
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                transport_error(e)
            } else {
                RagError::BackendError(format!("Malformed completion response: {}", e))
            }
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| RagError::BackendError("Completion response has no choices".to_string()))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);

        let mut req = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Completion backend health check failed: {}", e);
                false
            }
        }
    }
}
