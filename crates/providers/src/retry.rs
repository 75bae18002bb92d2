//! Retry with quadratic backoff and jitter around one HTTP exchange.
//!
//! Every upstream client sends its requests through a [`RetryExecutor`].
//! Connection failures, 5xx and 429 are retried; any other 4xx returns
//! immediately.

use std::time::Duration;

use pincer_core::error::ProviderError;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Sends a request, retrying transient failures.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryExecutor {
    /// `max_retries` extra attempts after the first; the delay before
    /// attempt `n` is `base_delay * n²` plus up to half that again.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &pincer_config::RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Sleep before the given attempt. Attempt 0 never waits.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let scaled = base_ms.saturating_mul(u64::from(attempt) * u64::from(attempt));
        let jitter = if scaled >= 2 {
            rand::rng().random_range(0..=scaled / 2)
        } else {
            0
        };
        Duration::from_millis(scaled + jitter)
    }

    /// Issue the request built by `build` until it succeeds, fails
    /// permanently, or the retry budget runs out.
    ///
    /// Failed response bodies are always read to completion before the
    /// next attempt so the pooled connection can be reused.
    pub async fn execute<F>(
        &self,
        provider: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last: Option<ProviderError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(provider, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                result = build().send() => result,
            };

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let err = if e.is_timeout() {
                        ProviderError::Timeout(e.to_string())
                    } else {
                        ProviderError::Network(e.to_string())
                    };
                    warn!(provider, attempt, error = %err, "Request failed");
                    last = Some(err);
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                return Ok(response);
            }

            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            let err = status_error(status, body);

            if err.is_transient() {
                warn!(provider, attempt, status, "Transient upstream error");
                last = Some(err);
                continue;
            }

            warn!(provider, status, error = %err, "Upstream rejected request");
            return Err(err);
        }

        let last = last.unwrap_or_else(|| ProviderError::Network("no attempt was made".into()));
        Err(ProviderError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last: Box::new(last),
        })
    }
}

/// Map a non-success HTTP status and its body to an error.
pub(crate) fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthenticationFailed(if body.is_empty() {
            "Invalid API key or insufficient permissions".into()
        } else {
            body
        }),
        429 => ProviderError::RateLimited(body),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}
