//! # pincer core
//!
//! Domain types, traits, and error definitions for the pincer agent runtime.
//! This crate has no HTTP or runtime wiring: it defines the message model,
//! the upstream client contract, and the collaborator interfaces that the
//! `providers` and `agent` crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem the agent loop talks to is a trait here:
//! - [`Provider`] for upstream language-model clients
//! - [`ToolExecutor`] and [`SecurityPolicy`] for tool calls
//! - [`SessionStore`] for conversation persistence
//! - [`InboundBus`] / [`OutboundSink`] for message delivery
//!
//! Tests swap any of them for hand-written mocks.

pub mod channel;
pub mod error;
pub mod message;
pub mod provider;
pub mod security;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use channel::{InboundBus, InboundMessage, OutboundMessage, OutboundSink};
pub use error::{Error, ProviderError, Result};
pub use message::{Arguments, Message, Role, ToolCall};
pub use provider::{ChatRequest, ChatResponse, Provider, StreamEvent, ToolDefinition, Usage};
pub use security::{AllowAll, PolicyDecision, SecurityPolicy};
pub use session::{Conversation, ConversationId, SessionStore};
pub use tool::{Tool, ToolExecutor, ToolRegistry};
pub use tokio_util::sync::CancellationToken;
