//! Per-entity token budgets.
//!
//! Each entity's budget starts at `starting_limit` and grows in `step_size`
//! increments whenever usage reaches `expand_fraction` of it, up to the
//! compression threshold. It never shrinks during a session.

use std::sync::Arc;

use dashmap::DashMap;
use dungeon_core::EntityId;
use serde::Serialize;
use tracing::{debug, info};

use crate::analytics::UsageAnalytics;
use crate::config::TokenSettings;

/// Result of an expansion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpansionOutcome {
    pub expanded: bool,
    pub previous_limit: usize,
    pub new_limit: usize,
}

impl ExpansionOutcome {
    fn unchanged(limit: usize) -> Self {
        Self {
            expanded: false,
            previous_limit: limit,
            new_limit: limit,
        }
    }
}

pub struct BudgetTracker {
    limits: DashMap<EntityId, usize>,
    starting_limit: usize,
    ceiling: usize,
    step: Option<usize>,
    expand_fraction: f64,
    auto_compression: bool,
    analytics: Option<Arc<UsageAnalytics>>,
}

impl BudgetTracker {
    pub fn new(settings: &TokenSettings) -> Self {
        let step = usize::try_from(settings.step_size).ok().filter(|s| *s > 0);
        Self {
            limits: DashMap::new(),
            starting_limit: settings.starting_limit.min(settings.compression_threshold),
            ceiling: settings.compression_threshold,
            step,
            expand_fraction: settings.expand_fraction,
            auto_compression: settings.enable_auto_compression,
            analytics: None,
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<UsageAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// The entity's ceiling; unseen entities start at `starting_limit`.
    pub fn current_limit(&self, entity: &EntityId) -> usize {
        self.limits
            .get(entity)
            .map(|limit| *limit)
            .unwrap_or(self.starting_limit)
    }

    /// Grow the entity's budget if `token_count` has reached the expansion
    /// threshold of its current limit.
    ///
    /// A zero limit adopts the first observed count (clamped to the
    /// ceiling) as its base before the threshold is computed.
    pub fn maybe_expand(&self, entity: &EntityId, token_count: usize) -> ExpansionOutcome {
        let outcome = {
            let mut limit = self
                .limits
                .entry(entity.clone())
                .or_insert(self.starting_limit);
            let previous = *limit;
            let base = if previous == 0 {
                token_count.min(self.ceiling)
            } else {
                previous
            };

            let Some(step) = self.step else {
                *limit = base;
                return ExpansionOutcome {
                    expanded: false,
                    previous_limit: previous,
                    new_limit: base,
                };
            };

            let threshold = (base as f64 * self.expand_fraction).floor() as usize;
            let candidate = base.saturating_add(step).min(self.ceiling);

            if token_count >= threshold && candidate > previous {
                *limit = candidate;
                ExpansionOutcome {
                    expanded: true,
                    previous_limit: previous,
                    new_limit: candidate,
                }
            } else {
                *limit = base;
                ExpansionOutcome {
                    expanded: false,
                    previous_limit: previous,
                    new_limit: base,
                }
            }
        };

        if outcome.expanded {
            info!(
                entity = %entity,
                old_limit = outcome.previous_limit,
                new_limit = outcome.new_limit,
                token_count,
                "expanded token budget"
            );
            if let Some(analytics) = &self.analytics {
                analytics.record_expansion(entity, outcome.previous_limit, outcome.new_limit);
            }
            #[cfg(feature = "metrics")]
            crate::metrics::BUDGET_EXPANSIONS_TOTAL.inc();
        }

        outcome
    }

    /// Whether the entity's conversation should be compressed now.
    ///
    /// Runs an expansion check first: a call that grows the budget never
    /// asks for compression.
    pub fn should_compress(&self, entity: &EntityId, token_count: usize) -> bool {
        if !self.auto_compression {
            return false;
        }
        if self.maybe_expand(entity, token_count).expanded {
            return false;
        }
        let compress = token_count >= self.ceiling;
        if compress {
            debug!(entity = %entity, token_count, ceiling = self.ceiling, "compression due");
        }
        compress
    }

    pub fn forget(&self, entity: &EntityId) -> bool {
        self.limits.remove(entity).is_some()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn tracked(&self) -> usize {
        self.limits.len()
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("entities", &self.limits.len())
            .field("starting_limit", &self.starting_limit)
            .field("ceiling", &self.ceiling)
            .field("step", &self.step)
            .finish()
    }
}
