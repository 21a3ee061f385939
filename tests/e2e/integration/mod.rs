//! Integration test utilities and helpers

pub mod fixtures {
    use std::sync::Once;

    use dungeon_context::{TokenCounterKind, TokenSettings};
    use dungeon_core::Message;

    static INIT: Once = Once::new();

    /// Initialize test environment
    pub fn init() {
        INIT.call_once(|| {
            // Logs only show up with RUST_LOG set
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    /// Small thresholds so a dozen turns reach compression. Counts use the
    /// character heuristic so turn sizes are predictable.
    pub fn small_settings() -> TokenSettings {
        TokenSettings {
            starting_limit: 200,
            step_size: 200,
            compression_threshold: 600,
            emergency_threshold: 2_000,
            max_context_tokens: 2_400,
            analytics_path: None,
            tokenizer: TokenCounterKind::Heuristic,
            ..Default::default()
        }
    }

    /// System prompt plus `turns` alternating player/character lines.
    pub fn conversation(system: &str, turns: usize, chars: usize) -> Vec<Message> {
        let mut messages = vec![Message::system(system)];
        for i in 0..turns {
            let line = format!("turn {i}: {}", "w".repeat(chars));
            messages.push(if i % 2 == 0 {
                Message::user(line)
            } else {
                Message::assistant(line)
            });
        }
        messages
    }
}

pub mod mock {
    use httpmock::prelude::*;
    use httpmock::Mock;

    /// Create a mock server for testing
    pub fn create_mock_server() -> MockServer {
        MockServer::start()
    }

    /// Mock Ollama `/api/generate` answering with `text`.
    pub fn mock_generate<'a>(server: &'a MockServer, text: &str) -> Mock<'a> {
        let body = serde_json::json!({
            "model": "qwen3:4b",
            "response": text,
            "done": true,
            "done_reason": "stop"
        });
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(body.clone());
        })
    }

    /// Mock Ollama `/api/generate` failing with `status`.
    pub fn mock_generate_error<'a>(server: &'a MockServer, status: u16) -> Mock<'a> {
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(status).body("model failed to load");
        })
    }
}

pub mod logs {
    use std::io;
    use std::sync::{Arc, Mutex};

    /// In-memory sink for a scoped tracing subscriber.
    #[derive(Clone, Default)]
    pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            let writer = self.clone();
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::WARN)
                .with_writer(move || writer.clone())
                .finish()
        }

        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("log buffer poisoned")).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

pub mod asserts {
    use dungeon_core::Message;

    /// Assert that compression kept the system prompt verbatim
    pub fn assert_system_prompt_kept(before: &[Message], after: &[Message]) {
        let original = before.first().filter(|m| m.is_system());
        if let Some(original) = original {
            assert_eq!(after.first(), Some(original), "system prompt was not preserved");
        }
    }
}
