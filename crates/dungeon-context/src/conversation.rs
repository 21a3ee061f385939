//! Per-entity conversation storage

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dungeon_core::{EntityId, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ContextError, ContextResult};

/// One entity's message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub entity: EntityId,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(entity: EntityId) -> Self {
        let now = Utc::now();
        Self {
            entity,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Conversation store keyed by entity.
///
/// Conversations are created on first write.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: Arc<RwLock<HashMap<EntityId, Conversation>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a conversation by entity
    pub async fn get(&self, entity: &EntityId) -> ContextResult<Conversation> {
        self.conversations
            .read()
            .await
            .get(entity)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(entity.to_string()))
    }

    /// The entity's messages, empty if it has none yet.
    pub async fn messages(&self, entity: &EntityId) -> Vec<Message> {
        self.conversations
            .read()
            .await
            .get(entity)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Append a message to a conversation
    pub async fn push(&self, entity: &EntityId, message: Message) {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(entity.clone())
            .or_insert_with(|| Conversation::new(entity.clone()));
        conversation.messages.push(message);
        conversation.touch();
    }

    /// Replace the whole message list, e.g. with a compressed one.
    pub async fn replace(&self, entity: &EntityId, messages: Vec<Message>) {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(entity.clone())
            .or_insert_with(|| Conversation::new(entity.clone()));
        conversation.messages = messages;
        conversation.touch();
    }

    /// Swap `original` for `compressed`, keeping messages appended since
    /// `original` was read. Returns false and changes nothing when the
    /// stored list no longer starts with `original`.
    pub async fn replace_prefix(
        &self,
        entity: &EntityId,
        original: &[Message],
        compressed: Vec<Message>,
    ) -> bool {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(entity.clone())
            .or_insert_with(|| Conversation::new(entity.clone()));
        if !conversation.messages.starts_with(original) {
            return false;
        }
        let appended = conversation.messages.split_off(original.len());
        conversation.messages = compressed;
        conversation.messages.extend(appended);
        conversation.touch();
        true
    }

    /// Set or replace the leading system prompt.
    pub async fn set_system_prompt(&self, entity: &EntityId, prompt: impl Into<String>) {
        let prompt = Message::system(prompt);
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(entity.clone())
            .or_insert_with(|| Conversation::new(entity.clone()));
        match conversation.messages.first_mut() {
            Some(first) if first.is_system() => *first = prompt,
            _ => conversation.messages.insert(0, prompt),
        }
        conversation.touch();
    }

    /// Delete a conversation
    pub async fn remove(&self, entity: &EntityId) -> ContextResult<Conversation> {
        self.conversations
            .write()
            .await
            .remove(entity)
            .ok_or_else(|| ContextError::NotFound(entity.to_string()))
    }

    pub async fn entities(&self) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self.conversations.read().await.keys().cloned().collect();
        entities.sort();
        entities
    }
}
