//! In-process session store.
//!
//! Conversations are keyed by `(channel, chat_id)`; messages are kept in
//! insertion order per conversation. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pincer_core::error::SessionError;
use pincer_core::message::Message;
use pincer_core::session::{Conversation, ConversationId, SessionStore};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    by_chat: HashMap<(String, String), ConversationId>,
    messages: HashMap<ConversationId, Vec<Message>>,
}

/// Session store backed by in-memory maps.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a conversation by id.
    pub async fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.read().await.conversations.get(id).cloned()
    }

    /// Number of stored messages across all conversations.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create_conversation(
        &self,
        channel: &str,
        chat_id: &str,
    ) -> Result<Conversation, SessionError> {
        let mut inner = self.inner.write().await;
        let key = (channel.to_string(), chat_id.to_string());

        if let Some(id) = inner.by_chat.get(&key) {
            if let Some(existing) = inner.conversations.get(id) {
                return Ok(existing.clone());
            }
        }

        let conversation = Conversation::new(channel, chat_id);
        inner.by_chat.insert(key, conversation.id.clone());
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    /// Most recent `limit` messages, oldest first.
    async fn get_history(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, SessionError> {
        let inner = self.inner.read().await;
        let messages = inner
            .messages
            .get(conversation)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn save_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.conversations.get_mut(conversation) else {
            return Err(SessionError::NotFound(conversation.to_string()));
        };
        entry.updated_at = Utc::now();
        inner
            .messages
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn update_title(
        &self,
        conversation: &ConversationId,
        title: &str,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        match inner.conversations.get_mut(conversation) {
            Some(entry) => {
                entry.title = Some(title.to_string());
                entry.updated_at = Utc::now();
                Ok(())
            }
            None => Err(SessionError::NotFound(conversation.to_string())),
        }
    }
}
