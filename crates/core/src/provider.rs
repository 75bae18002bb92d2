//! Provider trait: the abstraction over upstream language-model clients.
//!
//! A Provider knows how to send a conversation to one upstream dialect and
//! get a response back, either as a complete message or as a stream of
//! [`StreamEvent`]s.
//!
//! Implementations: OpenAI-compatible, Anthropic, Ollama, and the failover
//! chain that composes them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::{Message, ToolCall};

/// A request for one upstream exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The model to use (e.g., "gpt-4o", "claude-sonnet-4-20250514")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    0.7
}

impl ChatRequest {
    /// A request with default sampling settings and no tools.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: default_temperature(),
            stream: false,
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated text (may be empty when the model only calls tools)
    pub content: String,

    /// Structured tool calls requested by the model
    pub tool_calls: Vec<ToolCall>,

    /// Why generation stopped, as reported by the upstream
    pub finish_reason: Option<String>,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Wall-clock time of the exchange, retries included
    pub latency: Duration,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One event of a streamed response.
///
/// Only the terminal [`StreamEvent::Done`] carries the finalized tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text fragment.
    Token { content: String },

    /// Incremental reasoning fragment (dialects that expose it).
    Thinking { content: String },

    /// A tool name appeared for the first time in the stream.
    ToolStart { id: String, name: String },

    /// The upstream finished emitting a tool call's arguments.
    ToolEnd { id: String, name: String },

    /// Terminal event: full text plus finalized tool calls.
    Done {
        content: String,
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The stream failed; the producer closes the sink right after.
    Error { message: String },
}

impl StreamEvent {
    /// Event name as used on the wire by downstream consumers.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Thinking { .. } => "thinking",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// The upstream client contract.
///
/// Every wire dialect implements this trait, and so does the failover chain.
/// The agent loop calls [`Provider::chat`] without knowing which upstream
/// answers.
///
/// # Streaming ownership
///
/// [`Provider::chat_stream`] takes the event sender by value. The producer
/// owns it for the whole call and the receiver observes the end of the
/// stream when it is dropped, which happens exactly once on every return
/// path. Consumers only ever hold the receiving half.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;

    /// Whether [`Provider::chat_stream`] is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Send a request and forward the response as events into `sink`.
    ///
    /// Exactly one [`StreamEvent::Done`] is sent on success. On failure a
    /// best-effort [`StreamEvent::Error`] is sent before the error returns.
    async fn chat_stream(
        &self,
        _request: ChatRequest,
        sink: mpsc::Sender<StreamEvent>,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let err = ProviderError::NotSupported(format!(
            "provider '{}' does not support streaming",
            self.name()
        ));
        let _ = sink
            .send(StreamEvent::Error {
                message: err.to_string(),
            })
            .await;
        Err(err)
    }

    /// Whether the upstream accepts structured tool definitions.
    fn supports_tool_calling(&self) -> bool {
        true
    }

    /// Cheap reachability / credential probe, independent of `chat`.
    async fn healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlainProvider;

    #[async_trait]
    impl Provider for PlainProvider {
        fn name(&self) -> &str {
            "plain"
        }

        async fn chat(
            &self,
            _request: ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::NotConfigured("plain".into()))
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    #[test]
    fn chat_request_defaults() {
        let req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!req.stream);
        assert!(req.tools.is_empty());
    }

    #[test]
    fn usage_totals() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn stream_event_serialization() {
        let event = StreamEvent::ToolStart {
            id: "call_1".into(),
            name: "shell".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_start""#));
        assert_eq!(event.event_type(), "tool_start");
    }

    #[tokio::test]
    async fn default_chat_stream_reports_unsupported_and_closes_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        let result = PlainProvider
            .chat_stream(
                ChatRequest::new("m", vec![]),
                tx,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ProviderError::NotSupported(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Error { .. })));
        assert!(rx.recv().await.is_none());
    }
}
