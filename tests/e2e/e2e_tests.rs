//! End-to-End tests for the context engine
//!
//! These drive whole character turns through `ContextEngine` with the Ollama
//! provider pointed at a mock server.

mod integration;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dungeon_context::{
    build_counter, CompressionOutcome, ContextEngine, ReloadReason, TokenCounterKind, TokenSettings,
    UsageAnalytics, SUMMARY_PREFIX,
};
use dungeon_core::{EntityId, LocationId, Message};
use dungeon_runtime::{MockProvider, OllamaProvider};
use httpmock::prelude::*;

use integration::{asserts, fixtures, logs, mock};

const MIRA_PROMPT: &str = "You are Mira, the marsh herbalist. You distrust the baron.";

#[tokio::test]
async fn e2e_budget_grows_then_conversation_is_summarized() {
    fixtures::init();
    let server = mock::create_mock_server();
    let summary = mock::mock_generate(
        &server,
        "<think>keep the map</think>Mira promised the player a map of the marsh.",
    );

    let provider = Arc::new(OllamaProvider::new(server.base_url(), "qwen3:4b"));
    let engine = ContextEngine::new(fixtures::small_settings(), provider);
    let mira = EntityId::new("Mira");
    engine.conversations().set_system_prompt(&mira, MIRA_PROMPT).await;

    let mut limits = Vec::new();
    let mut reloads = Vec::new();
    let mut compressed_on = None;
    for turn in 0..40 {
        engine
            .conversations()
            .push(&mira, Message::user(format!("question {turn}: {}", "w".repeat(100))))
            .await;

        let plan = engine.prepare_stored_turn(&mira, "qwen3:4b").await;
        limits.push(plan.num_ctx);
        reloads.push(plan.reload);

        // the dialogue call itself happens here in the game
        engine.complete_turn(&mira, "qwen3:4b", plan.num_ctx, plan.token_count);
        engine
            .conversations()
            .push(&mira, Message::assistant(format!("answer {turn}: {}", "m".repeat(100))))
            .await;

        if plan.compression.is_some() {
            assert_eq!(plan.compression, Some(CompressionOutcome::Summarized));
            compressed_on = Some(turn);
            break;
        }
    }

    let turns = compressed_on.expect("conversation should reach compression") + 1;
    summary.assert();

    assert!(limits.windows(2).all(|w| w[0] <= w[1]), "limits shrank: {limits:?}");
    assert!(limits.iter().all(|l| *l <= 600));
    assert_eq!(limits.last(), Some(&600));

    assert_eq!(reloads[0], Some(ReloadReason::FirstUse));
    assert!(reloads.contains(&Some(ReloadReason::ContextGrew)));
    assert!(reloads.iter().filter(|r| r.is_none()).count() > 0);

    let messages = engine.conversations().messages(&mira).await;
    assert_eq!(messages[0], Message::system(MIRA_PROMPT));
    assert!(messages[1].content.starts_with(SUMMARY_PREFIX));
    assert!(messages[1].content.contains("map of the marsh"));
    assert!(!messages[1].content.contains("<think>"));

    let stats = engine.get_entity_analytics(&mira);
    assert_eq!(stats.record.api_calls, turns as u64);
    assert_eq!(stats.record.compressions, 1);
    assert!(stats.record.expansions >= 2);
}

#[tokio::test]
async fn e2e_backend_error_falls_back_to_truncation() {
    fixtures::init();
    let server = mock::create_mock_server();
    let failing = mock::mock_generate_error(&server, 500);

    let provider = Arc::new(OllamaProvider::new(server.base_url(), "qwen3:4b"));
    let engine = ContextEngine::new(fixtures::small_settings(), provider);
    let mira = EntityId::new("Mira");

    let messages = fixtures::conversation(MIRA_PROMPT, 20, 80);
    let report = engine.compress_report(&mira, &messages).await;

    failing.assert();
    assert_eq!(report.outcome, CompressionOutcome::Truncated);
    assert_eq!(report.messages.len(), 1 + 10);
    assert!(report.tokens_after < report.tokens_before);
    asserts::assert_system_prompt_kept(&messages, &report.messages);
}

#[tokio::test]
async fn e2e_slow_summarizer_times_out() {
    fixtures::init();
    let server = mock::create_mock_server();
    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .header("content-type", "application/json")
            .delay(Duration::from_secs(3))
            .json_body(serde_json::json!({ "response": "too late", "done": true }));
    });

    let settings = TokenSettings {
        summary_timeout_secs: 1,
        ..fixtures::small_settings()
    };
    let provider = Arc::new(OllamaProvider::new(server.base_url(), "qwen3:4b"));
    let engine = ContextEngine::new(settings, provider);

    let messages = fixtures::conversation(MIRA_PROMPT, 12, 40);
    let started = Instant::now();
    let compressed = engine.compress(&EntityId::new("Mira"), &messages).await;

    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert!(compressed.len() < messages.len());
    asserts::assert_system_prompt_kept(&messages, &compressed);
}

#[tokio::test]
async fn e2e_analytics_survive_restart() {
    fixtures::init();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state").join("token_analytics.json");
    let settings = TokenSettings {
        analytics_path: Some(path.clone()),
        analytics_autosave_every: 0,
        ..fixtures::small_settings()
    };
    let mira = EntityId::new("Mira");
    let bram = EntityId::new("Bram");

    {
        let engine = ContextEngine::new(settings.clone(), Arc::new(MockProvider::new()));
        engine.complete_turn(&mira, "qwen3:4b", 200, 150);
        engine.complete_turn(&mira, "qwen3:4b", 200, 250);
        engine.complete_turn(&bram, "qwen3:4b", 200, 900);
        engine.maybe_expand(&mira, 190);
    }
    assert!(path.exists(), "analytics are flushed when the engine is dropped");

    let engine = ContextEngine::new(settings, Arc::new(MockProvider::new()));
    let stats = engine.get_entity_analytics(&mira);
    assert_eq!(stats.record.total_tokens_used, 400);
    assert_eq!(stats.record.expansions, 1);
    assert_eq!(stats.avg_tokens_per_call, 200);

    let top = engine.get_top_users(1);
    assert_eq!(top[0].entity, bram);

    let summary = engine.get_system_summary();
    assert_eq!(summary.entities_tracked, 2);
    assert_eq!(summary.total_api_calls, 3);

    // budgets are session state and start over
    assert_eq!(engine.current_limit(&mira), 200);
}

#[tokio::test]
async fn e2e_overheard_context_reaches_other_characters() {
    fixtures::init();
    let engine = ContextEngine::new(fixtures::small_settings(), Arc::new(MockProvider::new()));
    let tavern = LocationId::new("Rusty Tankard");

    for i in 0..15 {
        engine.publish_shared_context(&tavern, format!("Round {i} is poured."), "barkeep");
    }
    engine.publish_shared_context(&tavern, "I ask about the baron.", "player");

    let stats = engine.shared_context_stats(&tavern);
    assert_eq!(stats.count, 10);
    assert_eq!(stats.recent_sources, vec!["barkeep", "barkeep", "player"]);

    let overheard = engine.read_shared_context(&tavern, 20);
    assert!(overheard.ends_with("I ask about the baron."));
    assert!(overheard.contains("(barkeep)"));
    assert!(engine.count_tokens(&overheard) <= 20);
    assert!(!overheard.contains("Round 5 "));

    assert_eq!(engine.read_shared_context(&LocationId::new("Cellar"), 1_000), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn e2e_characters_do_not_share_budgets() {
    fixtures::init();
    let engine = Arc::new(ContextEngine::with_parts(
        fixtures::small_settings(),
        Arc::new(MockProvider::new()),
        Arc::new(dungeon_context::HeuristicCounter),
        Arc::new(UsageAnalytics::in_memory()),
    ));

    let mut handles = Vec::new();
    for n in 0..8usize {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let entity = EntityId::new(format!("npc-{n}"));
            // even characters talk enough to grow twice, odd ones never
            let counts: &[usize] = if n % 2 == 0 { &[180, 360, 100] } else { &[10, 20, 30] };
            for count in counts {
                engine.maybe_expand(&entity, *count);
                engine.record_api_call(&entity, *count);
            }
            (n, engine.current_limit(&entity))
        }));
    }

    for handle in handles {
        let (n, limit) = handle.await.expect("task panicked");
        let expected = if n % 2 == 0 { 600 } else { 200 };
        assert_eq!(limit, expected, "npc-{n}");
    }
    assert_eq!(engine.get_system_summary().total_api_calls, 24);
}

// The only test in this binary that builds an unavailable backend, so the
// process-wide warning has not fired before it runs.
#[test]
fn e2e_unavailable_tokenizer_warns_once_per_process() {
    let captured = logs::CapturedLogs::default();
    let missing = TokenCounterKind::HuggingFace {
        tokenizer_path: "/no/such/model/tokenizer.json".into(),
    };

    tracing::subscriber::with_default(captured.subscriber(), || {
        let first = build_counter(&missing);
        let second = build_counter(&missing);
        assert_eq!(first.name(), "heuristic");
        assert_eq!(second.name(), "heuristic");
        assert_eq!(first.count("abcdabcd"), 2);
    });

    let text = captured.text();
    assert_eq!(text.matches("subword tokenizer unavailable").count(), 1, "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_compression_keeps_lines_spoken_while_summarizing() {
    fixtures::init();
    let provider = Arc::new(MockProvider::new().with_delay(Duration::from_millis(200)));
    provider.enqueue_text("Mira agreed to trade herbs for news of the baron.");
    let engine = Arc::new(ContextEngine::with_parts(
        fixtures::small_settings(),
        provider,
        Arc::new(dungeon_context::HeuristicCounter),
        Arc::new(UsageAnalytics::in_memory()),
    ));
    let mira = EntityId::new("Mira");
    engine
        .conversations()
        .replace(&mira, fixtures::conversation(MIRA_PROMPT, 30, 120))
        .await;
    // budget already at its ceiling, so the next turn compresses
    for _ in 0..5 {
        engine.maybe_expand(&mira, 1_000);
    }
    assert_eq!(engine.current_limit(&mira), 600);

    let preparing = {
        let engine = engine.clone();
        let mira = mira.clone();
        tokio::spawn(async move { engine.prepare_stored_turn(&mira, "qwen3:4b").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .conversations()
        .push(&mira, Message::user("Wait, one more thing."))
        .await;

    let plan = preparing.await.expect("turn task panicked");
    assert_eq!(plan.compression, Some(CompressionOutcome::Summarized));

    let stored = engine.conversations().messages(&mira).await;
    assert!(stored[1].content.starts_with(SUMMARY_PREFIX));
    assert_eq!(stored.last(), Some(&Message::user("Wait, one more thing.")));
    assert_eq!(stored.len(), plan.messages.len() + 1);
}

#[tokio::test]
#[ignore = "requires a running Ollama server with qwen3:4b"]
async fn e2e_live_ollama_summary() {
    fixtures::init();
    let engine = ContextEngine::new(
        TokenSettings {
            analytics_path: None,
            ..TokenSettings::from_env()
        },
        Arc::new(OllamaProvider::from_env()),
    );
    let messages = fixtures::conversation(MIRA_PROMPT, 12, 40);

    let report = engine.compress_report(&EntityId::new("Mira"), &messages).await;
    assert_eq!(report.outcome, CompressionOutcome::Summarized);
}
