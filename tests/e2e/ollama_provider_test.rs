use std::time::Duration;

use dungeon_runtime::{AIProvider, GenerateRequest, OllamaProvider, ProviderError};
use httpmock::prelude::*;

fn summary_request() -> GenerateRequest {
    GenerateRequest::new("Summarize: the player asked about the old mine.")
        .with_temperature(0.3)
        .with_context_size(8000)
}

#[tokio::test]
async fn ollama_generate_against_mock_api() {
    let server = MockServer::start();

    let generate_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/generate")
            .header("content-type", "application/json");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(serde_json::json!({
                "model": "qwen3:4b",
                "created_at": "2025-01-01T00:00:00Z",
                "response": "<think>short</think>The player asked about the old mine.",
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 42,
                "eval_count": 11
            }));
    });

    let provider = OllamaProvider::new(server.base_url(), "qwen3:4b");

    let response = provider
        .generate(summary_request())
        .await
        .expect("provider generate should succeed");

    generate_mock.assert();
    assert!(response.content.ends_with("The player asked about the old mine."));
    assert_eq!(response.model.as_deref(), Some("qwen3:4b"));
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert_eq!(response.prompt_tokens, Some(42));
    assert_eq!(response.completion_tokens, Some(11));
}

#[tokio::test]
async fn ollama_non_success_status_is_an_error() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(404)
            .body(r#"{"error":"model 'qwen3:4b' not found"}"#);
    });

    let provider = OllamaProvider::new(server.base_url(), "qwen3:4b");
    let err = provider.generate(summary_request()).await.unwrap_err();

    match err {
        ProviderError::HttpStatus { status, body } => {
            assert_eq!(status, 404);
            assert!(body.contains("not found"));
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn ollama_malformed_body_is_a_decode_error() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .header("content-type", "application/json")
            .body("{\"unexpected\": true}");
    });

    let provider = OllamaProvider::new(server.base_url(), "qwen3:4b");
    let err = provider.generate(summary_request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::Decode(_)));
}

#[tokio::test]
async fn ollama_blank_response_is_rejected() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(serde_json::json!({ "model": "qwen3:4b", "response": "   ", "done": true }));
    });

    let provider = OllamaProvider::new(server.base_url(), "qwen3:4b");
    let err = provider.generate(summary_request()).await.unwrap_err();

    assert_eq!(err, ProviderError::EmptyResponse);
}

#[tokio::test]
async fn ollama_slow_backend_times_out() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/api/generate");
        then.status(200)
            .delay(Duration::from_secs(3))
            .json_body(serde_json::json!({ "response": "late", "done": true }));
    });

    let provider =
        OllamaProvider::with_timeout(server.base_url(), "qwen3:4b", Duration::from_millis(200));
    let err = provider.generate(summary_request()).await.unwrap_err();

    assert_eq!(err, ProviderError::Timeout { after_ms: 200 });
}

#[tokio::test]
#[ignore = "requires a local Ollama server with the default model pulled"]
async fn ollama_generate_real_server() {
    let provider = OllamaProvider::from_env();

    let resp = provider
        .generate(GenerateRequest::new("Say 'Hello, adventurer!' and nothing else.").with_temperature(0.0))
        .await
        .unwrap();

    assert!(!resp.content.is_empty());
    println!("Response: {}", resp.content);
}
