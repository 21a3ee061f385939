//! Token counting.
//!
//! Counts are estimates: the engine keeps its thresholds well below the
//! backend's hard ceiling, so an error of ±20% never breaks a limit. A real
//! subword tokenizer is used when one is compiled in and loads; otherwise the
//! counter degrades to a characters-per-token approximation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Once};

use dungeon_core::Message;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tokens added per message for role and formatting markup.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Characters per token used by the approximation.
pub const CHARS_PER_TOKEN: usize = 4;

static DEGRADED_WARNING: Once = Once::new();

/// Trait for counting tokens in text and messages.
pub trait TokenCounter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Count tokens in a single string. Empty text is zero tokens.
    fn count(&self, text: &str) -> usize;

    /// Count tokens across a message list, including per-message overhead.
    fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.count(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }
}

/// Character-based approximation, always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }
}

/// BPE counter using the `cl100k_base` vocabulary.
///
/// Not exact for Qwen or Llama models, but much closer than the heuristic.
#[cfg(feature = "tiktoken")]
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenCounter {
    pub fn cl100k() -> crate::ContextResult<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| crate::ContextError::TokenCountError(e.to_string()))?;
        Ok(Self { bpe })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for TiktokenCounter {
    fn name(&self) -> &'static str {
        "tiktoken"
    }

    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Counter backed by a HuggingFace `tokenizer.json` for a model family.
#[cfg(feature = "token-counting")]
pub struct HfTokenizerCounter {
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "token-counting")]
impl HfTokenizerCounter {
    pub fn from_file(path: &std::path::Path) -> crate::ContextResult<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| crate::ContextError::TokenCountError(e.to_string()))?;
        Ok(Self { tokenizer })
    }
}

#[cfg(feature = "token-counting")]
impl TokenCounter for HfTokenizerCounter {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(_) => HeuristicCounter.count(text),
        }
    }
}

/// Which counter backend to build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenCounterKind {
    Heuristic,
    #[default]
    Tiktoken,
    HuggingFace {
        tokenizer_path: PathBuf,
    },
}

impl fmt::Display for TokenCounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenCounterKind::Heuristic => f.write_str("heuristic"),
            TokenCounterKind::Tiktoken => f.write_str("tiktoken"),
            TokenCounterKind::HuggingFace { tokenizer_path } => {
                write!(f, "huggingface:{}", tokenizer_path.display())
            }
        }
    }
}

impl FromStr for TokenCounterKind {
    type Err = String;

    /// Accepts `heuristic`, `tiktoken` or `huggingface:<path to tokenizer.json>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "heuristic" => Ok(Self::Heuristic),
            "tiktoken" => Ok(Self::Tiktoken),
            _ => match s.strip_prefix("huggingface:") {
                Some(path) if !path.is_empty() => Ok(Self::HuggingFace {
                    tokenizer_path: PathBuf::from(path),
                }),
                _ => Err(format!("unknown tokenizer '{s}'")),
            },
        }
    }
}

/// Build the requested counter, falling back to [`HeuristicCounter`].
pub fn build_counter(kind: &TokenCounterKind) -> Arc<dyn TokenCounter> {
    match kind {
        TokenCounterKind::Heuristic => Arc::new(HeuristicCounter),
        TokenCounterKind::Tiktoken => tiktoken_counter(),
        TokenCounterKind::HuggingFace { tokenizer_path } => huggingface_counter(tokenizer_path),
    }
}

#[cfg(feature = "tiktoken")]
fn tiktoken_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::cl100k() {
        Ok(counter) => Arc::new(counter),
        Err(e) => degraded(&e.to_string()),
    }
}

#[cfg(not(feature = "tiktoken"))]
fn tiktoken_counter() -> Arc<dyn TokenCounter> {
    degraded("built without the `tiktoken` feature")
}

#[cfg(feature = "token-counting")]
fn huggingface_counter(path: &std::path::Path) -> Arc<dyn TokenCounter> {
    match HfTokenizerCounter::from_file(path) {
        Ok(counter) => Arc::new(counter),
        Err(e) => degraded(&e.to_string()),
    }
}

#[cfg(not(feature = "token-counting"))]
fn huggingface_counter(_path: &std::path::Path) -> Arc<dyn TokenCounter> {
    degraded("built without the `token-counting` feature")
}

fn degraded(reason: &str) -> Arc<dyn TokenCounter> {
    degraded_with(&DEGRADED_WARNING, reason)
}

fn degraded_with(warned: &Once, reason: &str) -> Arc<dyn TokenCounter> {
    warned.call_once(|| {
        warn!(
            reason,
            chars_per_token = CHARS_PER_TOKEN,
            "subword tokenizer unavailable, using character-based token estimates"
        );
    });
    Arc::new(HeuristicCounter)
}
