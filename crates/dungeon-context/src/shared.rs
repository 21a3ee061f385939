//! Shared context pool.
//!
//! Things said aloud at a location are published here so that every entity
//! present can "overhear" them. Each location keeps a bounded FIFO of entries;
//! the token budget is applied only when a reader pulls a digest.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dungeon_core::LocationId;
use serde::Serialize;
use tracing::trace;

use crate::tokens::TokenCounter;

/// Source name of entries the player produced. They render without attribution.
pub const PLAYER_SOURCE: &str = "player";

const RECENT_SOURCES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedEntry {
    pub content: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
}

impl SharedEntry {
    fn render(&self) -> String {
        if self.source == PLAYER_SOURCE {
            self.content.clone()
        } else {
            format!("{} ({})", self.content, self.source)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SharedContextStats {
    pub count: usize,
    pub total_tokens: usize,
    /// Sources of the newest entries, oldest first.
    pub recent_sources: Vec<String>,
}

pub struct SharedContextPool {
    locations: DashMap<LocationId, VecDeque<SharedEntry>>,
    max_entries: usize,
    counter: Arc<dyn TokenCounter>,
}

impl SharedContextPool {
    pub fn new(max_entries: usize, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            locations: DashMap::new(),
            max_entries: max_entries.max(1),
            counter,
        }
    }

    /// Append an entry to the location's feed, evicting the oldest entries
    /// beyond the cap.
    pub fn publish(&self, location: &LocationId, content: impl Into<String>, source: impl Into<String>) {
        let content = content.into();
        let entry = SharedEntry {
            token_count: self.counter.count(&content),
            content,
            source: source.into(),
            timestamp: Utc::now(),
        };
        trace!(location = %location, source = %entry.source, tokens = entry.token_count, "shared context published");

        let mut feed = self.locations.entry(location.clone()).or_default();
        feed.push_back(entry);
        while feed.len() > self.max_entries {
            feed.pop_front();
        }

        #[cfg(feature = "metrics")]
        crate::metrics::SHARED_PUBLISHES_TOTAL.inc();
    }

    /// The newest entries that fit in `max_tokens`, in chronological order.
    ///
    /// Entries are taken whole, newest first, and the scan stops at the first
    /// one that does not fit.
    pub fn read(&self, location: &LocationId, max_tokens: usize) -> String {
        let Some(feed) = self.locations.get(location) else {
            return String::new();
        };

        let mut selected: Vec<String> = Vec::new();
        let mut total = 0usize;
        for entry in feed.iter().rev() {
            let next_total = total + entry.token_count;
            if next_total > max_tokens {
                break;
            }

            let rendered = entry.render();
            let candidate = join_chronological(std::iter::once(&rendered).chain(selected.iter().rev()));
            if self.counter.count(&candidate) > max_tokens {
                break;
            }

            selected.push(rendered);
            total = next_total;
        }

        join_chronological(selected.iter().rev())
    }

    pub fn stats(&self, location: &LocationId) -> SharedContextStats {
        let Some(feed) = self.locations.get(location) else {
            return SharedContextStats::default();
        };

        SharedContextStats {
            count: feed.len(),
            total_tokens: feed.iter().map(|e| e.token_count).sum(),
            recent_sources: feed
                .iter()
                .skip(feed.len().saturating_sub(RECENT_SOURCES))
                .map(|e| e.source.clone())
                .collect(),
        }
    }

    pub fn entries(&self, location: &LocationId) -> Vec<SharedEntry> {
        self.locations
            .get(location)
            .map(|feed| feed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, location: &LocationId) {
        self.locations.remove(location);
    }
}

fn join_chronological<'a>(parts: impl Iterator<Item = &'a String>) -> String {
    parts.map(String::as_str).collect::<Vec<_>>().join(" ")
}

impl std::fmt::Debug for SharedContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContextPool")
            .field("locations", &self.locations.len())
            .field("max_entries", &self.max_entries)
            .field("counter", &self.counter.name())
            .finish()
    }
}
