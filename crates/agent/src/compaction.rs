//! Context compaction: summarize old messages once a prompt grows past its
//! token budget.
//!
//! The compacted prompt is `[original system, summary, ...recent]` where the
//! summary is a single system message produced by one extra upstream call.
//! Any failure along the way (rate limiter cancelled, upstream error, empty
//! summary) leaves the prompt untouched.

use std::sync::Arc;

use pincer_config::CompactionConfig;
use pincer_core::message::{Message, Role};
use pincer_core::provider::{ChatRequest, Provider};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;

const SUMMARY_PROMPT: &str = "You compress conversation history. Summarize the conversation below \
in at most 200 words. Keep facts the user stated, decisions that were made, tool results that \
later turns may rely on, and any open questions. Write plain prose with no preamble.";

const SUMMARY_HEADER: &str = "[Conversation Summary]";

/// Approximate token count of a message list.
///
/// Each message counts `words / 0.75` (rounded, at least 1 for text with any
/// words); tool-call argument values are counted the same way.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            let calls: usize = m
                .tool_calls
                .iter()
                .flat_map(|tc| tc.arguments.values())
                .map(|v| match v {
                    Value::String(s) => estimate_text(s),
                    other => estimate_text(&other.to_string()),
                })
                .sum();
            estimate_text(&m.content) + calls
        })
        .sum()
}

fn estimate_text(text: &str) -> usize {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0;
    }
    ((words as f64 / 0.75).round() as usize).max(1)
}

/// Summarizes the older part of a prompt through the upstream.
pub struct ContextCompactor {
    provider: Arc<dyn Provider>,
    model: String,
    token_budget: usize,
    min_recent: usize,
    summary_max_tokens: u32,
    limiter: Option<Arc<RateLimiter>>,
}

impl ContextCompactor {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self::from_config(provider, model, &CompactionConfig::default())
    }

    pub fn from_config(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        config: &CompactionConfig,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            token_budget: config.token_budget,
            min_recent: config.min_recent,
            summary_max_tokens: config.summary_max_tokens,
            limiter: None,
        }
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_min_recent(mut self, min_recent: usize) -> Self {
        self.min_recent = min_recent;
        self
    }

    /// Summarization calls take a token from `limiter` like any other
    /// upstream call.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Whether `messages` is both long enough and large enough to compact.
    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        messages.len() > self.min_recent + 1 && estimate_tokens(messages) > self.token_budget
    }

    /// Compact `messages` if over budget. The first message is assumed to
    /// be the system prompt and is always kept; the last `min_recent`
    /// messages are kept verbatim.
    pub async fn compact(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<Message> {
        if !self.needs_compaction(&messages) {
            return messages;
        }

        let cutoff = messages.len().saturating_sub(self.min_recent).max(1);
        let older = &messages[1..cutoff];

        info!(
            total = messages.len(),
            summarized = older.len(),
            estimated_tokens = estimate_tokens(&messages),
            budget = self.token_budget,
            "Compacting conversation context"
        );

        let summary = match self.summarize(older, cancel).await {
            Some(summary) => summary,
            None => return messages,
        };

        let mut compacted = Vec::with_capacity(2 + messages.len() - cutoff);
        compacted.push(messages[0].clone());
        compacted.push(Message::system(format!("{SUMMARY_HEADER}\n{summary}")));
        compacted.extend_from_slice(&messages[cutoff..]);

        debug!(
            before = messages.len(),
            after = compacted.len(),
            "Compaction complete"
        );
        compacted
    }

    async fn summarize(&self, older: &[Message], cancel: &CancellationToken) -> Option<String> {
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.wait(cancel).await {
                debug!(error = %e, "Skipping compaction");
                return None;
            }
        }

        let mut request = ChatRequest::new(
            &self.model,
            vec![
                Message::system(SUMMARY_PROMPT),
                Message::user(format_transcript(older)),
            ],
        );
        request.temperature = 0.0;
        request.max_tokens = Some(self.summary_max_tokens);

        match self.provider.chat(request, cancel).await {
            Ok(response) => {
                let summary = response.content.trim();
                if summary.is_empty() {
                    warn!("Summarization returned no text, keeping full context");
                    None
                } else {
                    Some(summary.to_string())
                }
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed, keeping full context");
                None
            }
        }
    }
}

fn format_transcript(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 160);
    for msg in messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        buf.push_str(&msg.content);
        for tc in &msg.tool_calls {
            buf.push_str(&format!("\n  [tool_call: {}({})]", tc.name, tc.arguments_json()));
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pincer_core::error::ProviderError;
    use pincer_core::message::{Arguments, ToolCall};
    use pincer_core::provider::ChatResponse;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SummaryProvider {
        reply: Result<String, ()>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl SummaryProvider {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for SummaryProvider {
        fn name(&self) -> &str {
            "summary"
        }

        async fn chat(
            &self,
            request: ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(ChatResponse {
                    content: text.clone(),
                    tool_calls: vec![],
                    finish_reason: Some("stop".into()),
                    usage: None,
                    model: "mock".into(),
                    latency: Duration::ZERO,
                }),
                Err(()) => Err(ProviderError::ApiError {
                    status_code: 500,
                    message: "boom".into(),
                }),
            }
        }

        async fn healthy(&self) -> bool {
            true
        }
    }

    /// System prompt plus `n` user messages of `words` words each.
    fn long_prompt(n: usize, words: usize) -> Vec<Message> {
        let text = vec!["word"; words].join(" ");
        let mut messages = vec![Message::system("You are helpful.")];
        messages.extend((0..n).map(|i| Message::user(format!("{i} {text}"))));
        messages
    }

    #[test]
    fn estimate_counts_words() {
        assert_eq!(estimate_tokens(&[Message::user("")]), 0);
        assert_eq!(estimate_tokens(&[Message::user("   ")]), 0);
        assert_eq!(estimate_tokens(&[Message::user("hi")]), 1);
        assert_eq!(estimate_tokens(&[Message::user("one two three")]), 4);
        assert_eq!(
            estimate_tokens(&[Message::user("one two three"), Message::assistant("four five six")]),
            8
        );
    }

    #[test]
    fn estimate_includes_tool_arguments() {
        let mut args = Arguments::new();
        args.insert("query".into(), "rust async runtime".into());
        args.insert("limit".into(), 5.into());
        let msg = Message::assistant_with_tools("", vec![ToolCall::new("c1", "web_search", args)]);
        // "rust async runtime" -> 4, "5" -> 1
        assert_eq!(estimate_tokens(&[msg]), 5);
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let provider = SummaryProvider::replying("unused");
        let compactor = ContextCompactor::new(provider.clone(), "m").with_token_budget(10_000);
        let messages = long_prompt(20, 10);

        let out = compactor.compact(messages.clone(), &CancellationToken::new()).await;
        assert_eq!(out, messages);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn short_prompts_are_never_compacted() {
        let provider = SummaryProvider::replying("unused");
        let compactor = ContextCompactor::new(provider.clone(), "m")
            .with_token_budget(1)
            .with_min_recent(10);
        let messages = long_prompt(10, 100);

        let out = compactor.compact(messages.clone(), &CancellationToken::new()).await;
        assert_eq!(out.len(), 11);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn over_budget_summarizes_older_messages() {
        let provider = SummaryProvider::replying("  The user introduced themselves.  ");
        let compactor = ContextCompactor::new(provider.clone(), "summarizer")
            .with_token_budget(100)
            .with_min_recent(4);
        let messages = long_prompt(12, 20);

        let out = compactor.compact(messages.clone(), &CancellationToken::new()).await;

        assert_eq!(out.len(), 1 + 1 + 4);
        assert_eq!(out[0], messages[0]);
        assert_eq!(out[1].role, Role::System);
        assert_eq!(out[1].content, "[Conversation Summary]\nThe user introduced themselves.");
        assert_eq!(&out[2..], &messages[9..]);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "summarizer");
        assert_eq!(requests[0].max_tokens, Some(512));
        assert!(requests[0].tools.is_empty());
        // Older messages 1..9 went into the transcript.
        let transcript = &requests[0].messages[1].content;
        assert!(transcript.starts_with("User: 0 word"));
        assert!(transcript.contains("User: 7 word"));
        assert!(!transcript.contains("User: 8 word"));
    }

    #[tokio::test]
    async fn failed_summary_keeps_original() {
        let provider = SummaryProvider::failing();
        let compactor = ContextCompactor::new(provider.clone(), "m")
            .with_token_budget(10)
            .with_min_recent(2);
        let messages = long_prompt(8, 20);

        let out = compactor.compact(messages.clone(), &CancellationToken::new()).await;
        assert_eq!(out, messages);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn empty_summary_keeps_original() {
        let provider = SummaryProvider::replying("   ");
        let compactor = ContextCompactor::new(provider, "m")
            .with_token_budget(10)
            .with_min_recent(2);
        let messages = long_prompt(8, 20);

        let out = compactor.compact(messages.clone(), &CancellationToken::new()).await;
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn cancelled_rate_limit_skips_summary() {
        let provider = SummaryProvider::replying("summary");
        let compactor = ContextCompactor::new(provider.clone(), "m")
            .with_token_budget(10)
            .with_min_recent(2)
            .with_rate_limiter(Arc::new(RateLimiter::new(5, 30.0)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let messages = long_prompt(8, 20);
        let out = compactor.compact(messages.clone(), &cancel).await;
        assert_eq!(out, messages);
        assert_eq!(provider.calls(), 0);
    }
}
