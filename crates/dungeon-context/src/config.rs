//! Engine configuration.
//!
//! Every tunable constant of the budget, compression, reload and shared-pool
//! logic lives in [`TokenSettings`]. Values can come from serde (embedded in a
//! game's own config file) or from `DUNGEON_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tokens::TokenCounterKind;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Hard context ceiling of the backend model.
    pub max_context_tokens: usize,
    /// Token count at which compression takes over from expansion.
    pub compression_threshold: usize,
    /// Token count at which compression keeps only the shortest tail.
    pub emergency_threshold: usize,
    /// Initial per-entity budget. Zero adopts the first observed count.
    pub starting_limit: usize,
    /// Budget growth per expansion. Zero or negative disables expansion.
    pub step_size: i64,
    /// Fraction of the current budget that triggers an expansion.
    pub expand_fraction: f64,
    pub min_tokens_after_compression: usize,
    pub enable_auto_compression: bool,
    /// Reload the model when a smaller context is requested.
    pub reload_on_lower: bool,
    pub shared_pool_max_entries: usize,
    pub shared_read_default_tokens: usize,
    pub show_warnings: bool,
    pub summary_model: String,
    pub summary_context_size: u32,
    pub summary_temperature: f32,
    pub summary_timeout_secs: u64,
    /// Where usage analytics are persisted. `None` keeps them in memory only.
    pub analytics_path: Option<PathBuf>,
    /// Persist analytics after this many recorded calls. Zero disables autosave.
    pub analytics_autosave_every: u64,
    /// `keep_alive` sent with calls that (re)load the model.
    pub keep_alive: String,
    pub tokenizer: TokenCounterKind,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 40_000,
            compression_threshold: 35_000,
            emergency_threshold: 38_000,
            starting_limit: 0,
            step_size: 1_000,
            expand_fraction: 0.9,
            min_tokens_after_compression: 5_000,
            enable_auto_compression: true,
            reload_on_lower: false,
            shared_pool_max_entries: 10,
            shared_read_default_tokens: 1_000,
            show_warnings: true,
            summary_model: "qwen3:4b".to_string(),
            summary_context_size: 8_000,
            summary_temperature: 0.3,
            summary_timeout_secs: 60,
            analytics_path: Some(PathBuf::from("token_analytics.json")),
            analytics_autosave_every: 10,
            keep_alive: "5m".to_string(),
            tokenizer: TokenCounterKind::Tiktoken,
        }
    }
}

impl TokenSettings {
    /// Defaults overridden by `DUNGEON_*` environment variables (and `.env`).
    ///
    /// Unparseable values are logged and the default is kept.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut settings = Self::default();
        env_override("DUNGEON_MAX_CONTEXT_TOKENS", &mut settings.max_context_tokens);
        env_override("DUNGEON_COMPRESSION_THRESHOLD", &mut settings.compression_threshold);
        env_override("DUNGEON_EMERGENCY_THRESHOLD", &mut settings.emergency_threshold);
        env_override("DUNGEON_STARTING_LIMIT", &mut settings.starting_limit);
        env_override("DUNGEON_STEP_SIZE", &mut settings.step_size);
        env_override("DUNGEON_EXPAND_FRACTION", &mut settings.expand_fraction);
        env_override(
            "DUNGEON_MIN_TOKENS_AFTER_COMPRESSION",
            &mut settings.min_tokens_after_compression,
        );
        env_override("DUNGEON_ENABLE_AUTO_COMPRESSION", &mut settings.enable_auto_compression);
        env_override("DUNGEON_RELOAD_ON_LOWER", &mut settings.reload_on_lower);
        env_override("DUNGEON_SHARED_POOL_MAX_ENTRIES", &mut settings.shared_pool_max_entries);
        env_override("DUNGEON_SHARED_READ_TOKENS", &mut settings.shared_read_default_tokens);
        env_override("DUNGEON_SHOW_WARNINGS", &mut settings.show_warnings);
        env_override("DUNGEON_SUMMARY_MODEL", &mut settings.summary_model);
        env_override("DUNGEON_SUMMARY_CONTEXT_SIZE", &mut settings.summary_context_size);
        env_override("DUNGEON_SUMMARY_TEMPERATURE", &mut settings.summary_temperature);
        env_override("DUNGEON_SUMMARY_TIMEOUT_SECS", &mut settings.summary_timeout_secs);
        env_override("DUNGEON_ANALYTICS_AUTOSAVE_EVERY", &mut settings.analytics_autosave_every);
        env_override("DUNGEON_KEEP_ALIVE", &mut settings.keep_alive);

        if let Ok(path) = env::var("DUNGEON_ANALYTICS_PATH") {
            settings.analytics_path = match path.trim() {
                "" | "none" => None,
                p => Some(PathBuf::from(p)),
            };
        }

        if let Ok(kind) = env::var("DUNGEON_TOKENIZER") {
            match kind.parse() {
                Ok(kind) => settings.tokenizer = kind,
                Err(e) => warn!(value = %kind, error = %e, "ignoring DUNGEON_TOKENIZER"),
            }
        }

        settings
    }

    /// Normalizes values that would otherwise break the threshold math.
    ///
    /// Nothing here fails: bad values degrade to the conservative behaviour
    /// (no expansion, earlier compression).
    pub fn sanitized(mut self) -> Self {
        if !self.expand_fraction.is_finite() || self.expand_fraction < 0.0 {
            warn!(expand_fraction = self.expand_fraction, "expand_fraction invalid, using 0");
            self.expand_fraction = 0.0;
        }
        if self.step_size <= 0 {
            warn!(step_size = self.step_size, "step_size is not positive, budget expansion disabled");
        }
        if self.starting_limit > self.compression_threshold {
            warn!(
                starting_limit = self.starting_limit,
                compression_threshold = self.compression_threshold,
                "starting_limit above compression threshold, clamping"
            );
            self.starting_limit = self.compression_threshold;
        }
        if self.shared_pool_max_entries == 0 {
            warn!("shared_pool_max_entries is 0, keeping at least one entry per location");
            self.shared_pool_max_entries = 1;
        }
        if !self.summary_temperature.is_finite() || self.summary_temperature < 0.0 {
            self.summary_temperature = 0.3;
        }
        self
    }

    pub fn expansion_enabled(&self) -> bool {
        self.step_size > 0
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs.max(1))
    }
}

fn env_override<T>(key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(e) => warn!(key, value = %raw, error = %e, "ignoring unparseable setting"),
    }
}
