//! Message delivery contracts.
//!
//! Front-ends (chat platforms, CLI, web) publish inbound messages on an
//! [`InboundBus`] and receive replies through an [`OutboundSink`]. The agent
//! loop never knows which platform it is serving.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// A message received from a delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel name (e.g., "telegram", "cli")
    pub channel: String,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    /// Sender identifier (platform-specific user ID)
    pub sender_id: String,

    /// The text content
    pub content: String,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: String::new(),
            content: content.into(),
        }
    }
}

/// A reply addressed to a chat on a delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// Source of inbound messages.
#[async_trait]
pub trait InboundBus: Send + Sync {
    /// Start receiving messages. The stream ends when the bus closes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<InboundMessage>, ChannelError>;
}

/// Destination for replies.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, reply: OutboundMessage) -> Result<(), ChannelError>;
}
