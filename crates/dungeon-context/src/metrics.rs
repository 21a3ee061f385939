//! Prometheus metrics for the context engine
//!
//! Registered in the default registry; the host game decides whether and how
//! to expose them.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    // ============================================================================
    // Budget Metrics
    // ============================================================================

    /// Per-entity budget expansions
    pub static ref BUDGET_EXPANSIONS_TOTAL: Counter =
        register_counter!("dungeon_budget_expansions_total", "Total token budget expansions").unwrap();

    // ============================================================================
    // Compression Metrics
    // ============================================================================

    /// Compressions by outcome (summarized, truncated, unchanged)
    pub static ref COMPRESSIONS_TOTAL: CounterVec =
        register_counter_vec!("dungeon_compressions_total", "Conversation compressions by outcome", &["outcome"]).unwrap();

    /// Summarization call latency, including failed and timed out calls
    pub static ref SUMMARY_LATENCY_SECONDS: Histogram = register_histogram!(
        "dungeon_summary_latency_seconds",
        "Summarization call latency in seconds",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    // ============================================================================
    // Model / Pool / Usage Metrics
    // ============================================================================

    /// Model reloads advised, by reason
    pub static ref MODEL_RELOADS_ADVISED: CounterVec =
        register_counter_vec!("dungeon_model_reloads_advised_total", "Model reloads advised by reason", &["reason"]).unwrap();

    pub static ref SHARED_PUBLISHES_TOTAL: Counter =
        register_counter!("dungeon_shared_publishes_total", "Entries published to shared context pools").unwrap();

    /// Tokens reported through recorded API calls
    pub static ref API_TOKENS_TOTAL: Counter =
        register_counter!("dungeon_api_tokens_total", "Tokens used by recorded API calls").unwrap();
}

/// Export metrics in Prometheus format
pub fn export() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
