//! The context engine facade.
//!
//! [`ContextEngine`] owns one instance of every component and exposes the
//! calls the game makes around each character turn. It is meant to be
//! created once per game session and shared by reference or `Arc`.

use std::sync::Arc;

use dungeon_core::{EntityId, LocationId, Message};
use dungeon_runtime::{AIProvider, GenerateRequest};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analytics::{EntityAnalytics, SystemSummary, TopUser, UsageAnalytics};
use crate::budget::{BudgetTracker, ExpansionOutcome};
use crate::compress::{CompressionOutcome, CompressionReport, Compressor};
use crate::config::TokenSettings;
use crate::conversation::ConversationStore;
use crate::reload::{ModelReloadAdvisor, ModelState, ReloadReason};
use crate::shared::{SharedContextPool, SharedContextStats};
use crate::tokens::{build_counter, TokenCounter};
use crate::window::{ContextWindow, UsageReport, UsageWarning};

/// What the caller should do for the next backend call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnPlan {
    /// Messages to send, compressed if compression was due.
    pub messages: Vec<Message>,
    pub token_count: usize,
    /// Context size to request from the backend.
    pub num_ctx: usize,
    /// Set when the backend must reload the model for this call.
    pub reload: Option<ReloadReason>,
    pub keep_alive: Option<String>,
    pub expansion: ExpansionOutcome,
    pub compression: Option<CompressionOutcome>,
}

impl TurnPlan {
    /// Apply this plan's backend options to a request.
    pub fn apply(&self, request: GenerateRequest) -> GenerateRequest {
        let request = request.with_context_size(u32::try_from(self.num_ctx).unwrap_or(u32::MAX));
        match &self.keep_alive {
            Some(keep_alive) => request.with_keep_alive(keep_alive.clone()),
            None => request,
        }
    }
}

pub struct ContextEngine {
    settings: TokenSettings,
    counter: Arc<dyn TokenCounter>,
    budget: BudgetTracker,
    reload: ModelReloadAdvisor,
    compressor: Compressor,
    shared: SharedContextPool,
    analytics: Arc<UsageAnalytics>,
    conversations: ConversationStore,
    window: ContextWindow,
}

impl ContextEngine {
    /// Build an engine with the configured token counter and analytics file.
    pub fn new(settings: TokenSettings, provider: Arc<dyn AIProvider>) -> Self {
        let counter = build_counter(&settings.tokenizer);
        let analytics = match &settings.analytics_path {
            Some(path) => UsageAnalytics::open(path, settings.analytics_autosave_every),
            None => UsageAnalytics::in_memory(),
        };
        Self::with_parts(settings, provider, counter, Arc::new(analytics))
    }

    pub fn with_parts(
        settings: TokenSettings,
        provider: Arc<dyn AIProvider>,
        counter: Arc<dyn TokenCounter>,
        analytics: Arc<UsageAnalytics>,
    ) -> Self {
        let settings = settings.sanitized();
        info!(
            provider = provider.name(),
            counter = counter.name(),
            compression_threshold = settings.compression_threshold,
            starting_limit = settings.starting_limit,
            "context engine ready"
        );

        Self {
            budget: BudgetTracker::new(&settings).with_analytics(analytics.clone()),
            reload: ModelReloadAdvisor::new(settings.reload_on_lower),
            compressor: Compressor::new(&settings, provider, counter.clone())
                .with_analytics(analytics.clone()),
            shared: SharedContextPool::new(settings.shared_pool_max_entries, counter.clone()),
            window: ContextWindow::from_settings(&settings),
            conversations: ConversationStore::new(),
            counter,
            analytics,
            settings,
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    // ------------------------------------------------------------------
    // Token counting
    // ------------------------------------------------------------------

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    pub fn count_message_tokens(&self, messages: &[Message]) -> usize {
        self.counter.count_messages(messages)
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    pub fn current_limit(&self, entity: &EntityId) -> usize {
        self.budget.current_limit(entity)
    }

    pub fn should_expand(&self, entity: &EntityId, messages: &[Message]) -> ExpansionOutcome {
        self.budget.maybe_expand(entity, self.count_message_tokens(messages))
    }

    pub fn maybe_expand(&self, entity: &EntityId, token_count: usize) -> ExpansionOutcome {
        self.budget.maybe_expand(entity, token_count)
    }

    pub fn should_compress(&self, entity: &EntityId, messages: &[Message]) -> bool {
        self.budget
            .should_compress(entity, self.count_message_tokens(messages))
    }

    // ------------------------------------------------------------------
    // Compression
    // ------------------------------------------------------------------

    /// Compress regardless of `enable_auto_compression`.
    pub async fn compress(&self, entity: &EntityId, messages: &[Message]) -> Vec<Message> {
        self.compressor.compress(entity, messages).await
    }

    pub async fn compress_report(&self, entity: &EntityId, messages: &[Message]) -> CompressionReport {
        self.compressor.compress_report(entity, messages).await
    }

    // ------------------------------------------------------------------
    // Model reload
    // ------------------------------------------------------------------

    pub fn should_reload_model(&self, entity: &EntityId, model: &str, context_size: usize) -> bool {
        self.reload.should_reload(entity, model, context_size)
    }

    pub fn reload_reason(&self, entity: &EntityId, model: &str, context_size: usize) -> Option<ReloadReason> {
        self.reload.advise(entity, model, context_size)
    }

    /// Call only after a backend call with these parameters succeeded.
    pub fn record_model_state(&self, entity: &EntityId, model: &str, context_size: usize) {
        self.reload.record(entity, model, context_size);
    }

    pub fn model_state(&self, entity: &EntityId) -> Option<ModelState> {
        self.reload.state(entity)
    }

    pub fn model_state_info(&self, entity: &EntityId) -> String {
        self.reload.describe(entity)
    }

    // ------------------------------------------------------------------
    // Shared context
    // ------------------------------------------------------------------

    pub fn publish_shared_context(&self, location: &LocationId, content: impl Into<String>, source: impl Into<String>) {
        self.shared.publish(location, content, source);
    }

    pub fn read_shared_context(&self, location: &LocationId, max_tokens: usize) -> String {
        self.shared.read(location, max_tokens)
    }

    /// Read with `shared_read_default_tokens` as the budget.
    pub fn read_shared_context_default(&self, location: &LocationId) -> String {
        self.shared.read(location, self.settings.shared_read_default_tokens)
    }

    pub fn shared_context_stats(&self, location: &LocationId) -> SharedContextStats {
        self.shared.stats(location)
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    pub fn record_api_call(&self, entity: &EntityId, tokens_used: usize) {
        self.analytics.record_api_call(entity, tokens_used as u64);
    }

    pub fn get_entity_analytics(&self, entity: &EntityId) -> EntityAnalytics {
        self.analytics.entity(entity)
    }

    pub fn get_top_users(&self, limit: usize) -> Vec<TopUser> {
        self.analytics.top_users(limit)
    }

    pub fn get_system_summary(&self) -> SystemSummary {
        self.analytics.system_summary()
    }

    pub fn flush_analytics(&self) {
        self.analytics.flush();
    }

    // ------------------------------------------------------------------
    // Usage reporting
    // ------------------------------------------------------------------

    pub fn usage_warning(&self, current_tokens: usize) -> Option<UsageWarning> {
        self.window.usage_warning(current_tokens)
    }

    pub fn tokens_remaining(&self, current_tokens: usize) -> usize {
        self.window.tokens_remaining(current_tokens)
    }

    pub fn monitor_usage<'a, I>(&self, conversations: I) -> UsageReport
    where
        I: IntoIterator<Item = (&'a EntityId, &'a [Message])>,
    {
        self.window.monitor(self.counter.as_ref(), conversations)
    }

    /// Usage report over every stored conversation.
    pub async fn monitor_conversations(&self) -> UsageReport {
        let mut stored = Vec::new();
        for entity in self.conversations.entities().await {
            let messages = self.conversations.messages(&entity).await;
            stored.push((entity, messages));
        }
        self.monitor_usage(stored.iter().map(|(e, m)| (e, m.as_slice())))
    }

    // ------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------

    /// Run the pre-call checks for one turn: grow the budget or compress,
    /// then decide the context size and whether the model must reload.
    pub async fn prepare_turn(&self, entity: &EntityId, model: &str, messages: Vec<Message>) -> TurnPlan {
        let tokens = self.count_message_tokens(&messages);
        let expansion = self.budget.maybe_expand(entity, tokens);

        let (messages, compression) = if !expansion.expanded && self.budget.should_compress(entity, tokens) {
            let report = self.compressor.compress_report(entity, &messages).await;
            (report.messages, Some(report.outcome))
        } else {
            (messages, None)
        };

        let token_count = self.count_message_tokens(&messages);
        let limit = self.budget.current_limit(entity);
        let num_ctx = if limit == 0 {
            self.settings.max_context_tokens
        } else {
            limit
        };
        let reload = self.reload.advise(entity, model, num_ctx);
        let keep_alive = reload.map(|_| self.settings.keep_alive.clone());

        debug!(
            entity = %entity,
            token_count,
            num_ctx,
            reload = ?reload,
            expanded = expansion.expanded,
            compression = ?compression,
            "turn prepared"
        );

        TurnPlan {
            messages,
            token_count,
            num_ctx,
            reload,
            keep_alive,
            expansion,
            compression,
        }
    }

    /// Record a successful backend call made from a [`TurnPlan`].
    pub fn complete_turn(&self, entity: &EntityId, model: &str, num_ctx: usize, tokens_used: usize) {
        self.reload.record(entity, model, num_ctx);
        self.analytics.record_api_call(entity, tokens_used as u64);
    }

    /// [`prepare_turn`](Self::prepare_turn) over the stored conversation,
    /// saving the compressed list back when compression ran.
    ///
    /// Messages pushed while the summary is being generated are kept after
    /// the compressed list. If the conversation was replaced in the meantime
    /// the compressed list is not stored.
    pub async fn prepare_stored_turn(&self, entity: &EntityId, model: &str) -> TurnPlan {
        let original = self.conversations.messages(entity).await;
        let plan = self.prepare_turn(entity, model, original.clone()).await;
        if matches!(plan.compression, Some(outcome) if outcome != CompressionOutcome::Unchanged)
            && !self
                .conversations
                .replace_prefix(entity, &original, plan.messages.clone())
                .await
        {
            warn!(entity = %entity, "conversation changed during compression, keeping it uncompressed");
        }
        plan
    }

    /// Drop the entity's budget, model state and conversation. Analytics
    /// are kept. Returns whether anything was known about the entity.
    pub async fn forget_entity(&self, entity: &EntityId) -> bool {
        let had_budget = self.budget.forget(entity);
        let had_model = self.reload.forget(entity);
        let had_conversation = self.conversations.remove(entity).await.is_ok();
        info!(entity = %entity, "forgot entity");
        had_budget || had_model || had_conversation
    }
}

impl std::fmt::Debug for ContextEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEngine")
            .field("settings", &self.settings)
            .field("budget", &self.budget)
            .field("compressor", &self.compressor)
            .field("shared", &self.shared)
            .field("analytics", &self.analytics)
            .finish_non_exhaustive()
    }
}
