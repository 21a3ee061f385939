//! Text clean-up helpers for model output.

use std::sync::LazyLock;

use regex::Regex;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("think pattern is valid"));

static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("blank line pattern is valid"));

/// Removes `<think>...</think>` reasoning blocks emitted by reasoning models
/// and collapses the blank lines they leave behind.
pub fn strip_thinking(text: &str) -> String {
    let without_blocks = THINK_BLOCK.replace_all(text, "");
    BLANK_LINES
        .replace_all(&without_blocks, "\n")
        .trim()
        .to_string()
}
