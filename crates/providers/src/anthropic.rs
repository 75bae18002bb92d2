//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `event:`-named frames
//! - Extended thinking deltas surfaced as `thinking` events

use std::time::Instant;

use async_trait::async_trait;
use pincer_core::error::ProviderError;
use pincer_core::message::{Arguments, Message, Role, ToolCall};
use pincer_core::provider::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arguments::decode_arguments;
use crate::retry::RetryExecutor;
use crate::sse::{self, Flow, SseFrame, StreamState};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: Option<String>,
    client: reqwest::Client,
    retry: RetryExecutor,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: None,
            client: crate::router::http_client(),
            retry: RetryExecutor::default(),
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Share a pooled HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Always use this model, whatever the request asks for.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Extract system messages from the message list.
    /// Anthropic puts system prompt as a top-level field, not in messages.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&Message> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, non_system)
    }

    /// Convert messages to Anthropic API format with content blocks.
    ///
    /// Consecutive tool results are merged into one user turn, since the API
    /// requires every `tool_use` of an assistant turn to be answered in the
    /// very next message.
    fn to_api_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::User => {
                    result.push(AnthropicMessage {
                        role: "user".into(),
                        content: AnthropicContent::Text(msg.content.clone()),
                    });
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Text(msg.content.clone()),
                        });
                    } else {
                        let mut blocks: Vec<ContentBlock> = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: msg.content.clone(),
                            });
                        }
                        for tc in &msg.tool_calls {
                            blocks.push(ContentBlock::ToolUse {
                                id: tc.id.clone(),
                                name: tc.name.clone(),
                                input: tc.arguments.clone(),
                            });
                        }
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    let block = ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                    };
                    match result.last_mut() {
                        Some(AnthropicMessage {
                            role,
                            content: AnthropicContent::Blocks(blocks),
                        }) if role.as_str() == "user" => blocks.push(block),
                        _ => result.push(AnthropicMessage {
                            role: "user".into(),
                            content: AnthropicContent::Blocks(vec![block]),
                        }),
                    }
                }
                Role::System => {} // handled separately
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let (system, messages) = Self::extract_system(&request.messages);
        let model = self.model.as_deref().unwrap_or(&request.model);

        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.min(1.0),
        });

        if stream {
            body["stream"] = serde_json::json!(true);
        }

        if let Some(ref sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        self.retry
            .execute(&self.name, cancel, || {
                let builder = self
                    .client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(body);
                if stream {
                    builder.header("Accept", "text/event-stream")
                } else {
                    builder
                }
            })
            .await
    }

    /// Convert an Anthropic API response into a [`ChatResponse`].
    /// Thinking blocks are not part of the reply text.
    fn into_chat_response(
        resp: AnthropicResponse,
        latency: std::time::Duration,
    ) -> ChatResponse {
        let mut text_content = String::new();
        let mut tool_calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text } => {
                    if !text_content.is_empty() {
                        text_content.push('\n');
                    }
                    text_content.push_str(&text);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::new(id, name, input));
                }
                ResponseContentBlock::Other => {}
            }
        }

        ChatResponse {
            content: text_content,
            tool_calls,
            finish_reason: resp.stop_reason,
            usage: Some(Usage::new(resp.usage.input_tokens, resp.usage.output_tokens)),
            model: resp.model,
            latency,
        }
    }

    async fn stream_inner(
        &self,
        request: ChatRequest,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let body = self.build_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");
        let response = self.send(&body, true, cancel).await?;
        sse::pump(&self.name, response, BlockStream::default(), sink, cancel).await
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let body = self.build_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.send(&body, false, cancel).await?;
        let api_resp: AnthropicResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            parsed = response.json() => parsed.map_err(|e| {
                ProviderError::InvalidResponse(format!("Failed to parse Anthropic response: {e}"))
            })?,
        };

        Ok(Self::into_chat_response(api_resp, started.elapsed()))
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
        let result = self.stream_inner(request, &sink, cancel).await;
        sse::report_failure(&sink, result)
    }

    /// Credential probe: the model listing endpoint answers 200 only for a
    /// valid key and costs no tokens.
    async fn healthy(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Accumulates one streamed message. Blocks are keyed by their index.
#[derive(Default)]
struct BlockStream {
    content: String,
    open: Option<OpenToolUse>,
    tool_calls: Vec<ToolCall>,
    input_tokens: u32,
    output_tokens: u32,
}

struct OpenToolUse {
    index: u32,
    id: String,
    name: String,
    input_json: String,
}

impl BlockStream {
    fn close_tool(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open.take() {
            events.push(StreamEvent::ToolEnd {
                id: open.id.clone(),
                name: open.name.clone(),
            });
            let arguments = decode_arguments(&open.input_json, &open.name);
            self.tool_calls.push(ToolCall::new(open.id, open.name, arguments));
        }
    }
}

impl StreamState for BlockStream {
    fn on_frame(
        &mut self,
        frame: SseFrame,
        events: &mut Vec<StreamEvent>,
    ) -> Result<Flow, ProviderError> {
        let event: StreamPayload = match serde_json::from_str(&frame.data) {
            Ok(event) => event,
            Err(e) => {
                trace!(event = ?frame.event, error = %e, "Ignoring unparseable Anthropic SSE");
                return Ok(Flow::Continue);
            }
        };

        match event {
            StreamPayload::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.input_tokens = usage.input_tokens.unwrap_or(0);
                    self.output_tokens = usage.output_tokens.unwrap_or(0);
                }
            }
            StreamPayload::ContentBlockStart {
                index,
                content_block,
            } => {
                if let StartBlock::ToolUse { id, name } = content_block {
                    self.close_tool(events);
                    let id = if id.is_empty() {
                        ToolCall::generate_id()
                    } else {
                        id
                    };
                    events.push(StreamEvent::ToolStart {
                        id: id.clone(),
                        name: name.clone(),
                    });
                    self.open = Some(OpenToolUse {
                        index,
                        id,
                        name,
                        input_json: String::new(),
                    });
                }
            }
            StreamPayload::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        self.content.push_str(&text);
                        events.push(StreamEvent::Token { content: text });
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => match self.open.as_mut() {
                    Some(open) if open.index == index => open.input_json.push_str(&partial_json),
                    _ => trace!(index, "Argument fragment for a block that is not open"),
                },
                BlockDelta::ThinkingDelta { thinking } => {
                    events.push(StreamEvent::Thinking { content: thinking });
                }
                BlockDelta::Other => {}
            },
            StreamPayload::ContentBlockStop { index } => {
                if self.open.as_ref().is_some_and(|open| open.index == index) {
                    self.close_tool(events);
                }
            }
            StreamPayload::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    if let Some(input) = usage.input_tokens {
                        self.input_tokens = input;
                    }
                    if let Some(output) = usage.output_tokens {
                        self.output_tokens = output;
                    }
                }
            }
            StreamPayload::MessageStop => {
                self.close_tool(events);
                return Ok(Flow::Stop);
            }
            StreamPayload::Error { error } => {
                return Err(ProviderError::StreamInterrupted(error.message));
            }
            StreamPayload::Other => {}
        }

        Ok(Flow::Continue)
    }

    fn finish(mut self) -> StreamEvent {
        // A body that ends without message_stop still yields its open call.
        let mut dropped = Vec::new();
        self.close_tool(&mut dropped);

        let usage = (self.input_tokens > 0 || self.output_tokens > 0)
            .then(|| Usage::new(self.input_tokens, self.output_tokens));

        StreamEvent::Done {
            content: self.content,
            tool_calls: self.tool_calls,
            usage,
        }
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Arguments,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Arguments,
    },
    /// Thinking and any future block types
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamPayload {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<StreamUsage>,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run(frames: &[(&str, &str)]) -> (Vec<StreamEvent>, Result<StreamEvent, ProviderError>) {
        let mut state = BlockStream::default();
        let mut events = Vec::new();
        for (name, data) in frames {
            let frame = SseFrame {
                event: Some(name.to_string()),
                data: data.to_string(),
            };
            match state.on_frame(frame, &mut events) {
                Ok(Flow::Stop) => break,
                Ok(Flow::Continue) => {}
                Err(e) => return (events, Err(e)),
            }
        }
        (events, Ok(state.finish()))
    }

    #[test]
    fn constructor() {
        let provider = AnthropicProvider::new("sk-ant-test");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn constructor_with_base_url() {
        let provider =
            AnthropicProvider::new("sk-ant-test").with_base_url("https://custom.proxy.com/");
        assert_eq!(provider.base_url, "https://custom.proxy.com");
    }

    #[test]
    fn system_extraction() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::system("Be concise"),
            Message::user("Hello"),
            Message::assistant("Hi!"),
        ];

        let (system, non_system) = AnthropicProvider::extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(non_system.len(), 2);
        assert_eq!(non_system[0].role, Role::User);
        assert_eq!(non_system[1].role, Role::Assistant);
    }

    #[test]
    fn system_extraction_no_system() {
        let messages = vec![Message::user("Hello")];
        let (system, non_system) = AnthropicProvider::extract_system(&messages);
        assert!(system.is_none());
        assert_eq!(non_system.len(), 1);
    }

    #[test]
    fn message_conversion_with_tool_round() {
        let mut args = Arguments::new();
        args.insert("query".into(), serde_json::json!("rust"));
        let first = ToolCall::new("toolu_1", "web_search", args);
        let second = ToolCall::new("toolu_2", "system_info", Arguments::new());

        let messages = vec![
            Message::user("Search"),
            Message::assistant_with_tools("Let me search", vec![first.clone(), second.clone()]),
            Message::tool_result(&first, "results"),
            Message::tool_result(&second, "linux"),
        ];
        let refs: Vec<&Message> = messages.iter().collect();
        let api_msgs = AnthropicProvider::to_api_messages(&refs);

        assert_eq!(api_msgs.len(), 3);
        assert_eq!(api_msgs[1].role, "assistant");
        match &api_msgs[1].content {
            AnthropicContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 3);
                match &blocks[1] {
                    ContentBlock::ToolUse { id, name, input } => {
                        assert_eq!(id, "toolu_1");
                        assert_eq!(name, "web_search");
                        assert_eq!(input["query"], "rust");
                    }
                    other => panic!("Expected tool_use block, got {other:?}"),
                }
            }
            other => panic!("Expected blocks content, got {other:?}"),
        }

        // Both results share one user turn
        assert_eq!(api_msgs[2].role, "user");
        match &api_msgs[2].content {
            AnthropicContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("Expected blocks content, got {other:?}"),
        }
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "calculator".into(),
            description: "Evaluate math".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"expression": {"type": "string"}},
                "required": ["expression"]
            }),
        }];
        let api_tools = AnthropicProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].name, "calculator");
        assert_eq!(api_tools[0].input_schema["type"].as_str(), Some("object"));
    }

    #[test]
    fn body_has_top_level_system() {
        let provider = AnthropicProvider::new("sk");
        let request = ChatRequest::new(
            "claude-sonnet-4-20250514",
            vec![Message::system("Be brief"), Message::user("Hi")],
        );
        let body = provider.build_body(&request, false);
        assert_eq!(body["system"], "Be brief");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn parse_tool_use_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_02",
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "text", "text": "Let me calculate"},
                    {
                        "type": "tool_use",
                        "id": "toolu_abc",
                        "name": "calculator",
                        "input": {"expression": "2+2"}
                    }
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        let response = AnthropicProvider::into_chat_response(resp, Duration::ZERO);
        assert_eq!(response.content, "Let me calculate");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "toolu_abc");
        assert_eq!(response.tool_calls[0].arguments["expression"], "2+2");
        assert_eq!(response.usage.unwrap().total_tokens, 30);
    }

    #[test]
    fn thinking_blocks_left_out_of_content() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "thinking", "thinking": "I need to consider...", "signature": "x"},
                    {"type": "text", "text": "Here's my answer."}
                ],
                "usage": {"input_tokens": 15, "output_tokens": 25}
            }"#,
        )
        .unwrap();

        let response = AnthropicProvider::into_chat_response(resp, Duration::ZERO);
        assert_eq!(response.content, "Here's my answer.");
    }

    #[test]
    fn stream_text_and_tool_use() {
        let (events, done) = run(&[
            ("message_start", r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":25,"output_tokens":1}}}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}}"#),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            ("content_block_start", r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"shell","input":{}}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":" \"ls\"}"}}"#),
            ("content_block_stop", r#"{"type":"content_block_stop","index":1}"#),
            ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);

        assert_eq!(
            events,
            vec![
                StreamEvent::Token { content: "Checking".into() },
                StreamEvent::ToolStart { id: "toolu_1".into(), name: "shell".into() },
                StreamEvent::ToolEnd { id: "toolu_1".into(), name: "shell".into() },
            ]
        );

        match done.unwrap() {
            StreamEvent::Done { content, tool_calls, usage } => {
                assert_eq!(content, "Checking");
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].arguments["command"], "ls");
                assert_eq!(usage, Some(Usage::new(25, 15)));
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn stream_thinking_events() {
        let (events, _) = run(&[
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#),
            ("ping", r#"{"type":"ping"}"#),
        ]);
        assert_eq!(events, vec![StreamEvent::Thinking { content: "hmm".into() }]);
    }

    #[test]
    fn stream_error_frame_fails() {
        let (_, done) = run(&[(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )]);
        assert!(matches!(done, Err(ProviderError::StreamInterrupted(m)) if m == "Overloaded"));
    }

    #[test]
    fn stream_without_message_stop_keeps_open_call() {
        let (_, done) = run(&[
            ("content_block_start", r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_9","name":"read_file","input":{}}}"#),
            ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"a.txt\"}"}}"#),
        ]);
        match done.unwrap() {
            StreamEvent::Done { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].arguments["path"], "a.txt");
            }
            other => panic!("expected done, got {other:?}"),
        }
    }
}
