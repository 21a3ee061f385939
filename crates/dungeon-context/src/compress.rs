//! Conversation compression.
//!
//! Older turns are replaced by a short generated summary while the leading
//! system prompt and the most recent turns are kept verbatim. When the
//! summarizer fails or times out the conversation is truncated instead, so a
//! compression request always yields a bounded message list.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dungeon_core::{render_transcript, split_system_prompt, strip_thinking, EntityId, Message};
use dungeon_runtime::{AIProvider, GenerateRequest};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analytics::UsageAnalytics;
use crate::config::TokenSettings;
use crate::error::{ContextError, ContextResult};
use crate::tokens::TokenCounter;

/// Marks the synthetic system message that carries a summary.
pub const SUMMARY_PREFIX: &str = "[CONVERSATION SUMMARY]";

const NORMAL_TAIL: usize = 5;
const EMERGENCY_TAIL: usize = 3;
const FALLBACK_TAIL: usize = 10;

/// How the summarization sub-call is made.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOptions {
    pub model: String,
    pub context_size: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl SummaryOptions {
    pub fn from_settings(settings: &TokenSettings) -> Self {
        Self {
            model: settings.summary_model.clone(),
            context_size: settings.summary_context_size,
            temperature: settings.summary_temperature,
            timeout: settings.summary_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    Normal,
    Emergency,
}

impl CompressionMode {
    fn tail(self) -> usize {
        match self {
            CompressionMode::Normal => NORMAL_TAIL,
            CompressionMode::Emergency => EMERGENCY_TAIL,
        }
    }

    fn fallback_tail(self) -> usize {
        match self {
            CompressionMode::Normal => FALLBACK_TAIL,
            CompressionMode::Emergency => EMERGENCY_TAIL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionOutcome {
    /// Nothing safe to compress; the input is returned as is.
    Unchanged,
    /// Older turns were replaced by a generated summary.
    Summarized,
    /// The summarizer failed and older turns were dropped.
    Truncated,
}

impl CompressionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionOutcome::Unchanged => "unchanged",
            CompressionOutcome::Summarized => "summarized",
            CompressionOutcome::Truncated => "truncated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionReport {
    pub messages: Vec<Message>,
    pub outcome: CompressionOutcome,
    pub mode: CompressionMode,
    pub messages_before: usize,
    pub messages_after: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// The result is smaller than `min_tokens_after_compression`.
    pub below_floor: bool,
}

pub struct Compressor {
    provider: Arc<dyn AIProvider>,
    counter: Arc<dyn TokenCounter>,
    options: SummaryOptions,
    emergency_threshold: usize,
    min_tokens_after: usize,
    analytics: Option<Arc<UsageAnalytics>>,
}

impl Compressor {
    pub fn new(
        settings: &TokenSettings,
        provider: Arc<dyn AIProvider>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            provider,
            counter,
            options: SummaryOptions::from_settings(settings),
            emergency_threshold: settings.emergency_threshold,
            min_tokens_after: settings.min_tokens_after_compression,
            analytics: None,
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<UsageAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn options(&self) -> &SummaryOptions {
        &self.options
    }

    pub async fn compress(&self, entity: &EntityId, messages: &[Message]) -> Vec<Message> {
        self.compress_report(entity, messages).await.messages
    }

    /// Compress `messages` and report what happened.
    pub async fn compress_report(&self, entity: &EntityId, messages: &[Message]) -> CompressionReport {
        let tokens_before = self.counter.count_messages(messages);
        let mode = if tokens_before >= self.emergency_threshold {
            CompressionMode::Emergency
        } else {
            CompressionMode::Normal
        };

        if messages.len() <= 2 {
            return self.unchanged(messages, mode, tokens_before);
        }

        let (system, rest) = split_system_prompt(messages);
        let mut tail = mode.tail().min(rest.len());
        let mut split = rest.len() - tail;
        if split == 0 {
            debug!(entity = %entity, messages = messages.len(), "nothing to compress");
            return self.unchanged(messages, mode, tokens_before);
        }
        // one summarized message would replace one summary message
        if split == 1 {
            split = 2;
            tail -= 1;
        }

        if mode == CompressionMode::Emergency {
            warn!(entity = %entity, tokens = tokens_before, keep = tail, "emergency compression");
        }

        let candidate = &rest[..split];
        let started = Instant::now();
        let summary = self.summarize(entity, candidate).await;

        #[cfg(feature = "metrics")]
        crate::metrics::SUMMARY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        let (compressed, outcome) = match summary {
            Ok(summary) => {
                let mut out = Vec::with_capacity(tail + 2);
                out.extend(system.cloned());
                out.push(Message::system(format!(
                    "{SUMMARY_PREFIX} Previous interactions with {entity}: {summary}"
                )));
                out.extend_from_slice(&rest[split..]);
                (out, CompressionOutcome::Summarized)
            }
            Err(e) => {
                let keep = mode.fallback_tail().min(rest.len() - 1);
                warn!(
                    entity = %entity,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    keep,
                    "summarization failed, truncating conversation"
                );
                let mut out = Vec::with_capacity(keep + 1);
                out.extend(system.cloned());
                out.extend_from_slice(&rest[rest.len() - keep..]);
                (out, CompressionOutcome::Truncated)
            }
        };

        let tokens_after = self.counter.count_messages(&compressed);
        let below_floor = tokens_after < self.min_tokens_after;
        info!(
            entity = %entity,
            outcome = outcome.as_str(),
            messages_before = messages.len(),
            messages_after = compressed.len(),
            tokens_before,
            tokens_after,
            "compressed conversation"
        );
        if below_floor {
            debug!(
                entity = %entity,
                tokens_after,
                floor = self.min_tokens_after,
                "compressed context is below the configured minimum"
            );
        }

        if let Some(analytics) = &self.analytics {
            analytics.record_compression(entity, tokens_before, tokens_after);
        }
        #[cfg(feature = "metrics")]
        crate::metrics::COMPRESSIONS_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();

        CompressionReport {
            messages_before: messages.len(),
            messages_after: compressed.len(),
            messages: compressed,
            outcome,
            mode,
            tokens_before,
            tokens_after,
            below_floor,
        }
    }

    async fn summarize(&self, entity: &EntityId, candidate: &[Message]) -> ContextResult<String> {
        let prompt = summary_prompt(entity, candidate);
        let request = GenerateRequest::new(prompt)
            .with_model(self.options.model.clone())
            .with_temperature(self.options.temperature)
            .with_context_size(self.options.context_size);

        let response = tokio::time::timeout(self.options.timeout, self.provider.generate(request))
            .await
            .map_err(|_| dungeon_runtime::ProviderError::Timeout {
                after_ms: self.options.timeout.as_millis() as u64,
            })??;

        let summary = strip_thinking(&response.content);
        if summary.is_empty() {
            return Err(ContextError::EmptySummary);
        }
        Ok(summary)
    }

    fn unchanged(&self, messages: &[Message], mode: CompressionMode, tokens: usize) -> CompressionReport {
        CompressionReport {
            messages: messages.to_vec(),
            outcome: CompressionOutcome::Unchanged,
            mode,
            messages_before: messages.len(),
            messages_after: messages.len(),
            tokens_before: tokens,
            tokens_after: tokens,
            below_floor: false,
        }
    }
}

fn summary_prompt(entity: &EntityId, candidate: &[Message]) -> String {
    format!(
        "Summarize the conversation below between the player and {entity} in 2-3 sentences. \
         Keep only what {entity} should remember later: events, promises, decisions, \
         names and items that changed hands.\n\n\
         Conversation:\n{}\n\
         Summary:",
        render_transcript(candidate, entity.as_str())
    )
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("provider", &self.provider.name())
            .field("counter", &self.counter.name())
            .field("options", &self.options)
            .field("emergency_threshold", &self.emergency_threshold)
            .finish_non_exhaustive()
    }
}
