//! Failover chain: an ordered list of providers behind one [`Provider`].
//!
//! `chat` tries each member in order with a per-member timeout and returns
//! the first success. `chat_stream` hands the sink to the first member that
//! streams and never retries elsewhere, since that member owns and closes
//! the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pincer_core::error::ProviderError;
use pincer_core::provider::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sse;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A provider that wraps an ordered list of providers and fails over.
pub struct FailoverChain {
    name: String,
    chain: Vec<ChainEntry>,
    failovers: AtomicU64,
}

/// A single entry in the chain.
struct ChainEntry {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl FailoverChain {
    /// Create a new chain with no entries.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
            failovers: AtomicU64::new(0),
        }
    }

    /// Append a provider with a custom timeout.
    pub fn add(mut self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.chain.push(ChainEntry { provider, timeout });
        self
    }

    /// Append a provider with the default timeout (120s).
    pub fn add_default(self, provider: Arc<dyn Provider>) -> Self {
        self.add(provider, DEFAULT_TIMEOUT)
    }

    /// Number of providers in the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Member names, in order.
    pub fn members(&self) -> Vec<&str> {
        self.chain.iter().map(|e| e.provider.name()).collect()
    }

    /// How many successful calls were answered by a member other than the
    /// first.
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// Probe every member and report `(name, healthy)` in chain order.
    pub async fn probe(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.chain.len());
        for entry in &self.chain {
            let healthy = entry.provider.healthy().await;
            debug!(provider = %entry.provider.name(), healthy, "Probed chain member");
            report.push((entry.provider.name().to_string(), healthy));
        }
        report
    }
}

#[async_trait]
impl Provider for FailoverChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for (i, entry) in self.chain.iter().enumerate() {
            let provider_name = entry.provider.name();

            debug!(
                provider = %provider_name,
                attempt = i + 1,
                total = self.chain.len(),
                "Failover: trying provider"
            );

            match tokio::time::timeout(entry.timeout, entry.provider.chat(request.clone(), cancel))
                .await
            {
                Ok(Ok(response)) => {
                    if i > 0 {
                        self.failovers.fetch_add(1, Ordering::Relaxed);
                        info!(
                            chain = %self.name,
                            provider = %provider_name,
                            index = i,
                            "Failover: answered by fallback provider"
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(ProviderError::Cancelled)) => return Err(ProviderError::Cancelled),
                Ok(Err(e)) => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Failover: provider failed, trying next"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        provider = %provider_name,
                        timeout_secs = entry.timeout.as_secs(),
                        "Failover: provider timed out, trying next"
                    );
                    last_error = Some(ProviderError::Timeout(format!(
                        "Provider '{}' timed out after {}s",
                        provider_name,
                        entry.timeout.as_secs()
                    )));
                }
            }

            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
        }

        match last_error {
            Some(last) => Err(ProviderError::AllFailed {
                attempted: self.chain.len(),
                last: Box::new(last),
            }),
            None => Err(ProviderError::NotConfigured(
                "No providers in failover chain".into(),
            )),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        if let Some(entry) = self.chain.iter().find(|e| e.provider.supports_streaming()) {
            debug!(provider = %entry.provider.name(), "Failover: streaming via provider");
            return entry.provider.chat_stream(request, sink, cancel).await;
        }

        debug!(chain = %self.name, "Failover: no streaming member, synthesizing stream");
        let result = match self.chat(request, cancel).await {
            Ok(response) => {
                let events = [
                    StreamEvent::Token {
                        content: response.content.clone(),
                    },
                    StreamEvent::Done {
                        content: response.content,
                        tool_calls: response.tool_calls,
                        usage: response.usage,
                    },
                ];
                for event in events {
                    if sink.send(event).await.is_err() {
                        debug!(chain = %self.name, "Stream receiver dropped");
                        break;
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        sse::report_failure(&sink, result)
    }

    fn supports_tool_calling(&self) -> bool {
        self.chain.iter().any(|e| e.provider.supports_tool_calling())
    }

    async fn healthy(&self) -> bool {
        for entry in &self.chain {
            if entry.provider.healthy().await {
                return true;
            }
        }
        false
    }
}
