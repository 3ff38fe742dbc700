//! Inference provider client.
//!
//! The provider is an external text-completion service. Two wire dialects are supported:
//! Ollama (`POST /api/generate`) and the OpenAI-compatible completions API used by
//! llama.cpp, vLLM and similar servers (`POST /v1/completions`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use concierge_core::config::{LlmBackend, LlmConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("inference provider unavailable: {0}")]
    Unavailable(String),
    #[error("inference request timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference transport failure: {0}")]
    Transport(String),
    #[error("inference provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed inference response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Cheap reachability probe; never errors.
    async fn is_available(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

pub struct HttpLlmClient {
    http: Client,
    backend: LlmBackend,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        Ok(Self {
            http,
            backend: config.backend,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    pub fn backend(&self) -> LlmBackend {
        self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn generate_url(&self) -> String {
        match self.backend {
            LlmBackend::Ollama => format!("{}/api/generate", self.base_url),
            _ => format!("{}/v1/completions", self.base_url),
        }
    }

    fn probe_url(&self) -> String {
        match self.backend {
            LlmBackend::Ollama => format!("{}/api/tags", self.base_url),
            _ => format!("{}/v1/models", self.base_url),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(self.timeout)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let body = match self.backend {
            LlmBackend::Ollama => json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": self.temperature,
                    "num_predict": self.max_tokens,
                },
            }),
            _ => json!({
                "model": self.model,
                "prompt": prompt,
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
            }),
        };

        let response = self
            .authorize(self.http.post(self.generate_url()).json(&body))
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }

        match self.backend {
            LlmBackend::Ollama => {
                let parsed: OllamaResponse =
                    response.json().await.map_err(|err| LlmError::Malformed(err.to_string()))?;
                Ok(parsed.response)
            }
            _ => {
                let parsed: CompletionResponse =
                    response.json().await.map_err(|err| LlmError::Malformed(err.to_string()))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.text)
                    .ok_or_else(|| LlmError::Malformed("response has no choices".to_string()))
            }
        }
    }

    async fn is_available(&self) -> bool {
        let request = self.authorize(self.http.get(self.probe_url()).timeout(Duration::from_secs(2)));
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(
                    event_name = "agent.llm.probe_failed",
                    backend = ?self.backend,
                    error = %err,
                    "inference provider probe failed"
                );
                false
            }
        }
    }
}

/// Stand-in used when inference is switched off in configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("inference is disabled in configuration".to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }
}
