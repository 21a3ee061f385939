//! Model reload advice.
//!
//! Ollama keeps one instance of a model resident per context size. Asking for
//! a different `num_ctx` reloads it, which is slow, so the engine remembers
//! the parameters of each entity's last successful call and only asks for a
//! reload when they actually change.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dungeon_core::EntityId;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Parameters of an entity's last successful backend call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState {
    pub model: String,
    pub context_size: usize,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadReason {
    FirstUse,
    ModelChanged,
    ContextGrew,
    ContextShrank,
}

impl ReloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadReason::FirstUse => "first_use",
            ReloadReason::ModelChanged => "model_changed",
            ReloadReason::ContextGrew => "context_grew",
            ReloadReason::ContextShrank => "context_shrank",
        }
    }
}

impl std::fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct ModelReloadAdvisor {
    states: DashMap<EntityId, ModelState>,
    reload_on_lower: bool,
}

impl ModelReloadAdvisor {
    pub fn new(reload_on_lower: bool) -> Self {
        Self {
            states: DashMap::new(),
            reload_on_lower,
        }
    }

    /// Why the backend must reload before this call, or `None` if the loaded
    /// instance can be reused.
    pub fn advise(&self, entity: &EntityId, model: &str, context_size: usize) -> Option<ReloadReason> {
        let reason = match self.states.get(entity) {
            None => Some(ReloadReason::FirstUse),
            Some(state) if state.model != model => Some(ReloadReason::ModelChanged),
            Some(state) if context_size > state.context_size => Some(ReloadReason::ContextGrew),
            Some(state) if context_size < state.context_size && self.reload_on_lower => {
                Some(ReloadReason::ContextShrank)
            }
            Some(_) => None,
        };

        if let Some(reason) = reason {
            debug!(entity = %entity, model, context_size, %reason, "model reload advised");
            #[cfg(feature = "metrics")]
            crate::metrics::MODEL_RELOADS_ADVISED
                .with_label_values(&[reason.as_str()])
                .inc();
        }
        reason
    }

    pub fn should_reload(&self, entity: &EntityId, model: &str, context_size: usize) -> bool {
        self.advise(entity, model, context_size).is_some()
    }

    /// Store the parameters of a call that has completed successfully.
    pub fn record(&self, entity: &EntityId, model: impl Into<String>, context_size: usize) {
        let state = ModelState {
            model: model.into(),
            context_size,
            last_used: Utc::now(),
        };
        self.states.insert(entity.clone(), state);
    }

    pub fn state(&self, entity: &EntityId) -> Option<ModelState> {
        self.states.get(entity).map(|s| s.value().clone())
    }

    /// One-line description of the entity's loaded model, for diagnostics.
    pub fn describe(&self, entity: &EntityId) -> String {
        match self.state(entity) {
            Some(state) => format!(
                "{entity}: {} with {} token context (last used {})",
                state.model,
                state.context_size,
                state.last_used.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => format!("{entity}: no model loaded"),
        }
    }

    pub fn forget(&self, entity: &EntityId) -> bool {
        self.states.remove(entity).is_some()
    }
}
