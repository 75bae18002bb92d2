//! The agent turn loop for pincer.
//!
//! A turn follows a **call → act → observe** cycle:
//!
//! 1. **Receive** a user message (directly or from the inbound bus)
//! 2. **Build context**: system prompt, stored history, the new message,
//!    compacted into a summary when over the token budget
//! 3. **Call the upstream**, after taking a rate-limiter token
//! 4. **If tool calls** (structured, or recovered from text): run them under
//!    the security policy, append results, loop back to step 3
//! 5. **If text**: persist the exchange and reply
//!
//! The loop ends at the first text-only answer or after `max_iterations`
//! model calls.

pub mod compaction;
pub mod extractor;
pub mod loop_runner;
pub mod rate_limit;
pub mod session;

pub use compaction::{ContextCompactor, estimate_tokens};
pub use extractor::{extract_tool_calls, normalize_tool_name, sanitize_escapes};
pub use loop_runner::{AgentLoop, ERROR_REPLY, MAX_ITERATIONS_REPLY};
pub use rate_limit::RateLimiter;
pub use session::InMemorySessionStore;
