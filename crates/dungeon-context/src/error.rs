//! Error types for context management

use dungeon_runtime::ProviderError;
use thiserror::Error;

/// Context management error type
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Token counting error: {0}")]
    TokenCountError(String),

    #[error("Summarization failed: {0}")]
    Summarization(#[from] ProviderError),

    #[error("Summarizer returned no usable text")]
    EmptySummary,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
