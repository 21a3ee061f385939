//! Conversation messages exchanged with the dialogue backend.

use serde::{Deserialize, Serialize};

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a character's conversation.
///
/// By convention the first message of a list, when it has the `system` role,
/// is the standing instruction block for the character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

/// Splits a message list into its leading system prompt (if any) and the rest.
pub fn split_system_prompt(messages: &[Message]) -> (Option<&Message>, &[Message]) {
    match messages.split_first() {
        Some((first, rest)) if first.is_system() => (Some(first), rest),
        _ => (None, messages),
    }
}

/// Renders messages as a speaker-labelled transcript, one turn per line.
///
/// User turns are labelled `Player`, assistant turns with `speaker`. System
/// messages after the first position (earlier summaries) are kept as
/// `Earlier summary` lines so their facts carry forward.
pub fn render_transcript(messages: &[Message], speaker: &str) -> String {
    let mut out = String::new();
    for message in messages {
        let label = match message.role {
            MessageRole::User => "Player",
            MessageRole::Assistant => speaker,
            MessageRole::System => "Earlier summary",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(message.content.trim());
        out.push('\n');
    }
    out
}
