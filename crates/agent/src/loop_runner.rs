//! The agent turn loop.

use std::sync::Arc;

use pincer_config::AppConfig;
use pincer_core::channel::{InboundBus, InboundMessage, OutboundMessage, OutboundSink};
use pincer_core::error::{ChannelError, Error};
use pincer_core::message::{Message, ToolCall};
use pincer_core::provider::{ChatRequest, Provider};
use pincer_core::security::{PolicyDecision, SecurityPolicy};
use pincer_core::session::{Conversation, SessionStore};
use pincer_core::tool::ToolExecutor;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction::ContextCompactor;
use crate::extractor::extract_tool_calls;
use crate::rate_limit::RateLimiter;

/// Reply when a turn runs out of model calls while still calling tools.
pub const MAX_ITERATIONS_REPLY: &str =
    "I've reached the maximum number of tool call iterations. Please provide further guidance.";

/// Reply sent on the bus when a turn fails for any reason other than
/// cancellation.
pub const ERROR_REPLY: &str =
    "Sorry, something went wrong while processing your message. Please try again.";

const TITLE_MAX_CHARS: usize = 50;

/// Orchestrates one conversation turn: prompt assembly, model calls, tool
/// execution and persistence.
pub struct AgentLoop {
    /// Upstream client, normally a failover chain
    provider: Arc<dyn Provider>,

    /// Shared by every upstream call, compaction included
    limiter: Arc<RateLimiter>,

    compactor: Option<ContextCompactor>,

    tools: Arc<dyn ToolExecutor>,

    /// Consulted before every tool call when present
    policy: Option<Arc<dyn SecurityPolicy>>,

    sessions: Arc<dyn SessionStore>,

    inbound: Option<Arc<dyn InboundBus>>,
    outbound: Option<Arc<dyn OutboundSink>>,

    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    system_prompt: String,

    /// Maximum model calls per turn
    max_iterations: u32,

    /// Messages loaded from the session store per turn
    history_limit: usize,

    /// Turns running at once under [`AgentLoop::run`]
    max_concurrent_turns: usize,
}

impl AgentLoop {
    /// Create an agent loop with default settings and no compaction.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<dyn ToolExecutor>,
        sessions: Arc<dyn SessionStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            provider,
            limiter,
            compactor: None,
            tools,
            policy: None,
            sessions,
            inbound: None,
            outbound: None,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            system_prompt: "You are a helpful assistant.".into(),
            max_iterations: 20,
            history_limit: 50,
            max_concurrent_turns: 3,
        }
    }

    /// Build from application config. The compactor shares the loop's rate
    /// limiter.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolExecutor>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let compactor = ContextCompactor::from_config(
            provider.clone(),
            &config.default_model,
            &config.compaction,
        )
        .with_rate_limiter(limiter.clone());

        Self::new(provider, &config.default_model, tools, sessions, limiter)
            .with_compactor(compactor)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_system_prompt(&config.agent.system_prompt)
            .with_max_iterations(config.agent.max_iterations)
            .with_history_limit(config.agent.history_limit)
            .with_max_concurrent_turns(config.agent.max_concurrent_turns)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of model calls per turn.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_max_concurrent_turns(mut self, max: usize) -> Self {
        self.max_concurrent_turns = max.max(1);
        self
    }

    pub fn with_compactor(mut self, compactor: ContextCompactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_security_policy(mut self, policy: Arc<dyn SecurityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Attach the message bus used by [`AgentLoop::run`].
    pub fn with_channels(
        mut self,
        inbound: Arc<dyn InboundBus>,
        outbound: Arc<dyn OutboundSink>,
    ) -> Self {
        self.inbound = Some(inbound);
        self.outbound = Some(outbound);
        self
    }

    /// Run one turn for `text` in the conversation identified by
    /// `(channel, chat_id)` and return the final reply.
    ///
    /// The user message and the final reply are persisted afterwards;
    /// persistence failures are logged and do not fail the turn.
    pub async fn process_direct(
        &self,
        text: &str,
        channel: &str,
        chat_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let conversation = self
            .sessions
            .get_or_create_conversation(channel, chat_id)
            .await?;
        let history = self
            .sessions
            .get_history(&conversation.id, self.history_limit)
            .await?;

        info!(
            conversation_id = %conversation.id,
            channel,
            history = history.len(),
            "Processing message"
        );

        let first_turn = history.is_empty();
        let user = Message::user(text);
        let reply = self.run_turn(history, user.clone(), cancel).await?;

        self.persist(&conversation, &user, &reply, first_turn).await;
        Ok(reply)
    }

    /// Consume the inbound bus until it closes or `cancel` fires, running
    /// at most `max_concurrent_turns` turns at once. In-flight turns are
    /// awaited before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let (Some(inbound), Some(outbound)) = (self.inbound.clone(), self.outbound.clone()) else {
            return Err(ChannelError::NotConfigured("agent loop has no message bus".into()).into());
        };

        let mut rx = inbound.subscribe().await?;
        let permits = Arc::new(Semaphore::new(self.max_concurrent_turns));
        let mut turns = JoinSet::new();

        info!(max_concurrent = self.max_concurrent_turns, "Agent loop started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => message,
                    None => {
                        debug!("Inbound bus closed");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                acquired = permits.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let agent = self.clone();
            let outbound = outbound.clone();
            let cancel = cancel.clone();
            turns.spawn(async move {
                let _permit = permit;
                agent.handle_inbound(message, outbound.as_ref(), &cancel).await;
            });

            while let Some(finished) = turns.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Turn task panicked");
                }
            }
        }

        while let Some(finished) = turns.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Turn task panicked");
            }
        }

        info!("Agent loop stopped");
        Ok(())
    }

    async fn handle_inbound(
        &self,
        message: InboundMessage,
        outbound: &dyn OutboundSink,
        cancel: &CancellationToken,
    ) {
        let content = match self
            .process_direct(&message.content, &message.channel, &message.chat_id, cancel)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_cancelled() => {
                debug!(chat_id = %message.chat_id, "Turn cancelled, no reply sent");
                return;
            }
            Err(e) => {
                error!(chat_id = %message.chat_id, error = %e, "Turn failed");
                ERROR_REPLY.to_string()
            }
        };

        let reply = OutboundMessage {
            channel: message.channel,
            chat_id: message.chat_id,
            content,
        };
        if let Err(e) = outbound.send(reply).await {
            warn!(error = %e, "Failed to deliver reply");
        }
    }

    async fn run_turn(
        &self,
        history: Vec<Message>,
        user: Message,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(&self.system_prompt));
        messages.extend(history);
        messages.push(user);

        if let Some(compactor) = &self.compactor {
            messages = compactor.compact(messages, cancel).await;
        }

        let tool_definitions = if self.provider.supports_tool_calling() {
            self.tools.definitions()
        } else {
            Vec::new()
        };

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.limiter.wait(cancel).await?;

            debug!(iteration, messages = messages.len(), "Agent loop iteration");

            let mut request = ChatRequest::new(&self.model, messages.clone());
            request.temperature = self.temperature;
            request.max_tokens = self.max_tokens;
            request.tools = tool_definitions.clone();

            let response = self.provider.chat(request, cancel).await?;

            let mut content = response.content;
            let mut tool_calls = response.tool_calls;
            if tool_calls.is_empty() && !content.trim().is_empty() {
                let recovered = extract_tool_calls(&content);
                if !recovered.is_empty() {
                    info!(count = recovered.len(), "Recovered tool calls from response text");
                    tool_calls = recovered;
                    content.clear();
                }
            }

            if tool_calls.is_empty() {
                debug!(iteration, "Turn complete");
                return Ok(content);
            }

            debug!(tool_count = tool_calls.len(), "Executing tool calls");
            messages.push(Message::assistant_with_tools(content, tool_calls.clone()));

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let result = self.run_tool(call, cancel).await?;
                messages.push(Message::tool_result(call, result));
            }
        }

        warn!(
            max_iterations = self.max_iterations,
            "Max tool iterations reached, giving up on the turn"
        );
        Ok(MAX_ITERATIONS_REPLY.to_string())
    }

    /// Execute one tool call and return the text fed back to the model.
    /// Only cancellation is an error; everything else becomes result text.
    async fn run_tool(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<String, Error> {
        if let Some(policy) = &self.policy {
            let command = command_text(call);
            match policy.check(&call.name, &command) {
                PolicyDecision::Allow => {}
                PolicyDecision::Block => {
                    warn!(tool = %call.name, "Tool call blocked by security policy");
                    return Ok(format!(
                        "Tool '{}' was blocked by the security policy and was not executed.",
                        call.name
                    ));
                }
                PolicyDecision::Confirm => {
                    let approved = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        approved = policy.request_confirmation(&call.name, &command) => approved,
                    };
                    if !approved {
                        info!(tool = %call.name, "Tool call denied by the user");
                        return Ok(format!(
                            "Tool '{}' was not approved by the user and was not executed.",
                            call.name
                        ));
                    }
                }
            }
        }

        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = self.tools.execute(&call.name, &call.arguments) => outcome,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, duration_ms, "Tool executed");
                Ok(output)
            }
            Err(e) => {
                warn!(tool = %call.name, duration_ms, error = %e, "Tool execution failed");
                Ok(format!("Error executing tool {}: {e}", call.name))
            }
        }
    }

    async fn persist(
        &self,
        conversation: &Conversation,
        user: &Message,
        reply: &str,
        first_turn: bool,
    ) {
        let id = &conversation.id;

        if let Err(e) = self.sessions.save_message(id, user).await {
            warn!(conversation_id = %id, error = %e, "Failed to save user message");
        }
        if let Err(e) = self.sessions.save_message(id, &Message::assistant(reply)).await {
            warn!(conversation_id = %id, error = %e, "Failed to save reply");
        }

        if first_turn {
            let title = conversation_title(&user.content);
            if let Err(e) = self.sessions.update_title(id, &title).await {
                warn!(conversation_id = %id, error = %e, "Failed to set conversation title");
            }
        }
    }
}

/// What the security policy sees as the tool's "command".
fn command_text(call: &ToolCall) -> String {
    match call.arguments.get("command") {
        Some(Value::String(command)) => command.clone(),
        _ => call.arguments_json(),
    }
}

fn conversation_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    line.chars().take(TITLE_MAX_CHARS).collect()
}
