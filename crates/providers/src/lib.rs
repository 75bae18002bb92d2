//! Upstream model clients for pincer.
//!
//! All clients implement the `pincer_core::Provider` trait and send their
//! requests through a shared [`RetryExecutor`]. The router builds an ordered
//! [`FailoverChain`] from configuration.

mod arguments;
pub mod anthropic;
pub mod failover;
pub mod ollama;
pub mod openai_compat;
pub mod retry;
pub mod router;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use failover::FailoverChain;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryExecutor;
pub use router::{build_from_config, http_client};
