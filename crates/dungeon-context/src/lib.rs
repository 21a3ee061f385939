//! Ollama Dungeon context engine - token budgets and conversation compression
//!
//! This crate provides:
//! - Token counting (pluggable, optional subword tokenizers)
//! - Per-character budget expansion and compression
//! - Model reload advice for changed context sizes
//! - Shared per-location context pools
//! - Usage analytics with JSON persistence
//! - Metrics (optional, feature-gated)

pub mod analytics;
pub mod budget;
pub mod compress;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod reload;
pub mod shared;
pub mod tokens;
pub mod window;

pub use analytics::{AnalyticsRecord, EntityAnalytics, SystemSummary, TopUser, UsageAnalytics};
pub use budget::{BudgetTracker, ExpansionOutcome};
pub use compress::{
    CompressionMode, CompressionOutcome, CompressionReport, Compressor, SummaryOptions, SUMMARY_PREFIX,
};
pub use config::TokenSettings;
pub use conversation::{Conversation, ConversationStore};
pub use engine::{ContextEngine, TurnPlan};
pub use error::{ContextError, ContextResult};
pub use reload::{ModelReloadAdvisor, ModelState, ReloadReason};
pub use shared::{SharedContextPool, SharedContextStats, SharedEntry, PLAYER_SOURCE};
pub use tokens::{build_counter, HeuristicCounter, TokenCounter, TokenCounterKind};
pub use window::{ContextWindow, EntityUsage, UsageLevel, UsageReport, UsageStatus, UsageWarning};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::TokenSettings;
    pub use crate::engine::{ContextEngine, TurnPlan};
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::tokens::TokenCounter;
    pub use dungeon_core::{EntityId, LocationId, Message, MessageRole};
}
