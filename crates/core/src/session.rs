//! Session store contract. Conversation persistence lives outside the
//! agent loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::Message;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation metadata as tracked by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    /// Delivery channel the conversation lives on (e.g. "cli", "telegram")
    pub channel: String,

    /// Chat identifier within the channel
    pub chat_id: String,

    /// Optional title, set from the first user message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            title: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistent conversation storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Find the conversation for `(channel, chat_id)` or create a new one.
    async fn get_or_create_conversation(
        &self,
        channel: &str,
        chat_id: &str,
    ) -> Result<Conversation, SessionError>;

    /// The most recent `limit` messages, oldest first.
    async fn get_history(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, SessionError>;

    async fn save_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), SessionError>;

    async fn update_title(
        &self,
        conversation: &ConversationId,
        title: &str,
    ) -> Result<(), SessionError>;
}
