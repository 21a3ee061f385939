//! Runtime abstractions for text-generation backends.
//!
//! The context engine only ever needs one kind of outbound call: "generate
//! text for this prompt with these sampling options". [`AIProvider`] is that
//! seam; [`OllamaProvider`] talks to a local Ollama server and
//! [`MockProvider`] replays queued results in tests.

pub mod providers;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use providers::OllamaProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Context window the backend should allocate (`num_ctx` for Ollama).
    pub context_size: Option<u32>,
    /// How long the backend keeps the model resident after the call.
    pub keep_alive: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = Some(context_size);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl GenerateResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            finish_reason: Some("stop".to_string()),
            prompt_tokens: None,
            completion_tokens: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("mock provider has no queued response")]
    MockQueueEmpty,
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("response decode error: {0}")]
    Decode(String),
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("provider returned an empty response")]
    EmptyResponse,
    #[error("provider error: {0}")]
    Message(String),
}

#[async_trait]
pub trait AIProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}

#[derive(Debug, Default)]
pub struct MockProvider {
    generate_queue: Mutex<VecDeque<Result<GenerateResponse, ProviderError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before answering, for exercising caller-side timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn enqueue_generate(&self, result: Result<GenerateResponse, ProviderError>) {
        self.generate_queue
            .lock()
            .expect("mock generate queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_text(&self, content: impl Into<String>) {
        self.enqueue_generate(Ok(GenerateResponse::text(content)));
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }
}

#[async_trait]
impl AIProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        self.requests
            .lock()
            .expect("mock request log poisoned")
            .push(req);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.generate_queue
            .lock()
            .expect("mock generate queue poisoned")
            .pop_front()
            .unwrap_or(Err(ProviderError::MockQueueEmpty))
    }
}
