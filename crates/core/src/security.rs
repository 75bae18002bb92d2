//! Security policy contract consulted before every tool execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Verdict of a policy check for one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Run the tool.
    Allow,
    /// Refuse without asking.
    Block,
    /// Ask for an out-of-band confirmation first.
    Confirm,
}

/// Gatekeeper for tool execution.
///
/// `command` is the human-readable form of the invocation: the `command`
/// argument for shell-like tools, otherwise the serialized arguments.
#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    fn check(&self, tool: &str, command: &str) -> PolicyDecision;

    /// Await an external confirmation. `false` means denied.
    async fn request_confirmation(&self, tool: &str, command: &str) -> bool;
}

/// Policy that allows every invocation.
pub struct AllowAll;

#[async_trait]
impl SecurityPolicy for AllowAll {
    fn check(&self, _tool: &str, _command: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }

    async fn request_confirmation(&self, _tool: &str, _command: &str) -> bool {
        true
    }
}
