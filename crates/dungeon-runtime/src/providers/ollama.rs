//! Ollama Provider
//!
//! Implements the AIProvider trait for Ollama's native `/api/generate`
//! endpoint (non-streaming).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::{AIProvider, GenerateRequest, GenerateResponse, ProviderError};

const OLLAMA_API_BASE: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "qwen3:4b";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Ollama API Provider
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    pub default_model: String,
    timeout: Duration,
}

impl OllamaProvider {
    /// Create provider from `OLLAMA_BASE_URL` / `OLLAMA_MODEL`, loading `.env` first.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let base_url = env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| OLLAMA_API_BASE.to_string());

        let default_model = env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Self::new(base_url, default_model)
    }

    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self::with_timeout(base_url, default_model, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into(),
            default_model: default_model.into(),
            timeout,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn get_model(&self, req: &GenerateRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: GenerateRequest) -> OllamaGenerateRequest {
        OllamaGenerateRequest {
            model: self.get_model(&req),
            prompt: req.prompt,
            stream: false,
            options: OllamaOptions {
                num_ctx: req.context_size,
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
            keep_alive: req.keep_alive,
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(OLLAMA_API_BASE, DEFAULT_MODEL)
    }
}

// ============================================================================
// Ollama API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    model: Option<String>,
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl AIProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let body = self.build_body(req);
        tracing::debug!(model = %body.model, num_ctx = ?body.options.num_ctx, "ollama generate");

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read body>".to_string());
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let ollama_resp: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let content = ollama_resp.response.trim().to_string();
        if content.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        Ok(GenerateResponse {
            content,
            model: ollama_resp.model,
            finish_reason: ollama_resp.done_reason,
            prompt_tokens: ollama_resp.prompt_eval_count,
            completion_tokens: ollama_resp.eval_count,
        })
    }
}
