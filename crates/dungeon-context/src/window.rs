//! Context window usage reporting

use dungeon_core::{EntityId, Message};
use serde::{Deserialize, Serialize};

use crate::config::TokenSettings;
use crate::tokens::TokenCounter;

/// Critical at 95% of the hard ceiling.
const CRITICAL_PERCENT: usize = 95;
/// Info/medium at 80% of the compression threshold.
const INFO_PERCENT: usize = 80;

fn at_least_percent(tokens: usize, limit: usize, percent: usize) -> bool {
    tokens.saturating_mul(100) >= limit.saturating_mul(percent)
}

/// Context window limits used for warnings and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// Hard ceiling of the backend model
    pub max_tokens: usize,
    /// Point at which compression takes over
    pub compression_threshold: usize,
    pub show_warnings: bool,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::from_settings(&TokenSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageWarning {
    pub level: UsageLevel,
    pub message: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Normal,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityUsage {
    pub entity: EntityId,
    pub tokens: usize,
    pub status: UsageStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub total_tokens: usize,
    pub entity_count: usize,
    pub entities: Vec<EntityUsage>,
    pub high_usage: Vec<EntityId>,
    pub compression_needed: bool,
}

impl ContextWindow {
    pub fn from_settings(settings: &TokenSettings) -> Self {
        Self {
            max_tokens: settings.max_context_tokens,
            compression_threshold: settings.compression_threshold,
            show_warnings: settings.show_warnings,
        }
    }

    /// Tokens left before compression kicks in.
    pub fn tokens_remaining(&self, current_tokens: usize) -> usize {
        self.compression_threshold.saturating_sub(current_tokens)
    }

    pub fn usage_warning(&self, current_tokens: usize) -> Option<UsageWarning> {
        if !self.show_warnings {
            return None;
        }

        let (level, message) = if at_least_percent(current_tokens, self.max_tokens, CRITICAL_PERCENT) {
            (
                UsageLevel::Critical,
                "very close to the context limit, the conversation will be heavily compressed",
            )
        } else if current_tokens >= self.compression_threshold {
            (UsageLevel::Warning, "context limit reached, compression will happen soon")
        } else if at_least_percent(current_tokens, self.compression_threshold, INFO_PERCENT) {
            (UsageLevel::Info, "context is getting large, consider compressing it")
        } else {
            return None;
        };

        Some(UsageWarning { level, message })
    }

    pub fn status(&self, tokens: usize) -> UsageStatus {
        if tokens > self.compression_threshold {
            UsageStatus::High
        } else if tokens.saturating_mul(100) > self.compression_threshold.saturating_mul(INFO_PERCENT) {
            UsageStatus::Medium
        } else {
            UsageStatus::Normal
        }
    }

    /// Token usage across several entities' conversations.
    pub fn monitor<'a, I>(&self, counter: &dyn TokenCounter, conversations: I) -> UsageReport
    where
        I: IntoIterator<Item = (&'a EntityId, &'a [Message])>,
    {
        let mut report = UsageReport::default();
        for (entity, messages) in conversations {
            let tokens = counter.count_messages(messages);
            let status = self.status(tokens);
            report.total_tokens += tokens;
            if status == UsageStatus::High {
                report.high_usage.push(entity.clone());
            }
            report.entities.push(EntityUsage {
                entity: entity.clone(),
                tokens,
                status,
            });
        }
        report.entity_count = report.entities.len();
        report.compression_needed = !report.high_usage.is_empty();
        report
    }
}
