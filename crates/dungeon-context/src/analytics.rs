//! Per-entity token usage analytics.
//!
//! Counters only ever grow. State is persisted as a JSON object keyed by
//! entity name, saved every `autosave_every` recorded calls and on drop.
//! A single writer per analytics file is assumed: two processes sharing one
//! file will overwrite each other's counters.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dungeon_core::EntityId;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::error::ContextResult;

/// Counters kept for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsRecord {
    pub total_tokens_used: u64,
    pub api_calls: u64,
    pub expansions: u64,
    pub compressions: u64,
    pub peak_tokens: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub conversation_turns: u64,
}

impl AnalyticsRecord {
    pub fn avg_tokens_per_call(&self) -> u64 {
        if self.api_calls == 0 {
            0
        } else {
            self.total_tokens_used / self.api_calls
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityAnalytics {
    pub entity: EntityId,
    #[serde(flatten)]
    pub record: AnalyticsRecord,
    pub avg_tokens_per_call: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopUser {
    pub entity: EntityId,
    pub total_tokens: u64,
    pub api_calls: u64,
    pub expansions: u64,
    pub compressions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemSummary {
    pub entities_tracked: usize,
    pub total_tokens_used: u64,
    pub total_api_calls: u64,
    pub total_expansions: u64,
    pub total_compressions: u64,
    pub avg_tokens_per_call: u64,
}

pub struct UsageAnalytics {
    records: DashMap<EntityId, AnalyticsRecord>,
    path: Option<PathBuf>,
    autosave_every: u64,
    calls_recorded: AtomicU64,
    dirty: AtomicBool,
    save_lock: Mutex<()>,
}

impl UsageAnalytics {
    /// Analytics that are never written to disk.
    pub fn in_memory() -> Self {
        Self::new(None, 0)
    }

    pub fn new(path: Option<PathBuf>, autosave_every: u64) -> Self {
        Self {
            records: DashMap::new(),
            path,
            autosave_every,
            calls_recorded: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        }
    }

    /// Create analytics backed by `path`, seeding from it when it exists.
    ///
    /// A missing or unreadable file is not an error; the session simply
    /// starts from empty counters.
    pub fn open(path: impl Into<PathBuf>, autosave_every: u64) -> Self {
        let analytics = Self::new(Some(path.into()), autosave_every);
        match analytics.load() {
            Ok(count) => debug!(entities = count, "loaded token analytics"),
            Err(e) => warn!(error = %e, "could not load token analytics, starting empty"),
        }
        analytics
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Merge the persisted file into memory. Entities already tracked in
    /// memory keep their in-memory counters. Returns how many were added.
    pub fn load(&self) -> ContextResult<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let raw = fs::read_to_string(path)?;
        let stored: BTreeMap<EntityId, AnalyticsRecord> = serde_json::from_str(&raw)?;

        let mut added = 0;
        for (entity, record) in stored {
            self.records.entry(entity).or_insert_with(|| {
                added += 1;
                record
            });
        }
        Ok(added)
    }

    /// Write all counters to the analytics file.
    ///
    /// Saves are serialized. The dirty flag is cleared before the snapshot
    /// is taken, so anything recorded while the file is being written is
    /// picked up by the next flush.
    pub fn save(&self) -> ContextResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.dirty.store(false, Ordering::SeqCst);
        let result = self.write_snapshot(path);
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn write_snapshot(&self, path: &Path) -> ContextResult<()> {
        let snapshot: BTreeMap<EntityId, AnalyticsRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        debug!(path = %path.display(), entities = snapshot.len(), "saved token analytics");
        Ok(())
    }

    /// Save if anything changed since the last save. Errors are logged.
    ///
    /// This is blocking file I/O.
    pub fn flush(&self) {
        if !self.dirty.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "could not save token analytics");
        }
    }

    /// Periodic save from inside a turn. On a multi-threaded tokio runtime
    /// the write runs through `block_in_place` so other tasks on this worker
    /// move elsewhere; a current-thread runtime blocks for the write.
    fn autosave(&self) {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.flush())
            }
            _ => self.flush(),
        }
    }

    pub fn record_api_call(&self, entity: &EntityId, tokens_used: u64) {
        let now = Utc::now();
        {
            let mut record = self.records.entry(entity.clone()).or_default();
            record.total_tokens_used += tokens_used;
            record.api_calls += 1;
            record.conversation_turns += 1;
            record.peak_tokens = record.peak_tokens.max(tokens_used);
            record.last_active = Some(now);
            record.first_seen.get_or_insert(now);
        }
        self.dirty.store(true, Ordering::SeqCst);

        #[cfg(feature = "metrics")]
        crate::metrics::API_TOKENS_TOTAL.inc_by(tokens_used as f64);

        let calls = self.calls_recorded.fetch_add(1, Ordering::SeqCst) + 1;
        if self.autosave_every > 0 && calls % self.autosave_every == 0 {
            self.autosave();
        }
    }

    pub fn record_expansion(&self, entity: &EntityId, old_limit: usize, new_limit: usize) {
        self.touch(entity, |record| record.expansions += 1);
        debug!(entity = %entity, old_limit, new_limit, "recorded budget expansion");
    }

    pub fn record_compression(&self, entity: &EntityId, tokens_before: usize, tokens_after: usize) {
        self.touch(entity, |record| record.compressions += 1);
        debug!(entity = %entity, tokens_before, tokens_after, "recorded compression");
    }

    fn touch(&self, entity: &EntityId, update: impl FnOnce(&mut AnalyticsRecord)) {
        {
            let mut record = self.records.entry(entity.clone()).or_default();
            record.first_seen.get_or_insert_with(Utc::now);
            update(record.value_mut());
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Stats for one entity; an unknown entity reports zeroed counters.
    pub fn entity(&self, entity: &EntityId) -> EntityAnalytics {
        let record = self
            .records
            .get(entity)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        EntityAnalytics {
            entity: entity.clone(),
            avg_tokens_per_call: record.avg_tokens_per_call(),
            record,
        }
    }

    /// Entities ordered by total tokens used, highest first.
    pub fn top_users(&self, limit: usize) -> Vec<TopUser> {
        let mut users: Vec<TopUser> = self
            .records
            .iter()
            .map(|entry| TopUser {
                entity: entry.key().clone(),
                total_tokens: entry.total_tokens_used,
                api_calls: entry.api_calls,
                expansions: entry.expansions,
                compressions: entry.compressions,
            })
            .collect();

        users.sort_by(|a, b| {
            b.total_tokens
                .cmp(&a.total_tokens)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        users.truncate(limit);
        users
    }

    pub fn system_summary(&self) -> SystemSummary {
        let mut summary = SystemSummary::default();
        for entry in &self.records {
            summary.entities_tracked += 1;
            summary.total_tokens_used += entry.total_tokens_used;
            summary.total_api_calls += entry.api_calls;
            summary.total_expansions += entry.expansions;
            summary.total_compressions += entry.compressions;
        }
        if summary.total_api_calls > 0 {
            summary.avg_tokens_per_call = summary.total_tokens_used / summary.total_api_calls;
        }
        summary
    }
}

impl Drop for UsageAnalytics {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for UsageAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAnalytics")
            .field("entities", &self.records.len())
            .field("path", &self.path)
            .field("autosave_every", &self.autosave_every)
            .finish_non_exhaustive()
    }
}
