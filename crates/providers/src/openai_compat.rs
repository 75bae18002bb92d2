//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, vLLM, Together AI, Groq, and any endpoint
//! exposing `/chat/completions` with `tools[].function` definitions.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool calls whose `arguments` arrive either as an object or as a
//!   JSON-encoded string
//! - Health checks via the model listing endpoint

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use pincer_core::error::ProviderError;
use pincer_core::message::{Message, Role, ToolCall};
use pincer_core::provider::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arguments::{RawArguments, decode_arguments};
use crate::retry::RetryExecutor;
use crate::sse::{self, Flow, SseFrame, StreamState};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: Option<String>,
    client: reqwest::Client,
    retry: RetryExecutor,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: None,
            client: crate::router::http_client(),
            retry: RetryExecutor::default(),
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
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

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments_json(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: match m.role {
                    Role::Tool => m.tool_call_id.clone(),
                    _ => None,
                },
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let model = self.model.as_deref().unwrap_or(&request.model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
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
        let url = format!("{}/chat/completions", self.base_url);
        self.retry
            .execute(&self.name, cancel, || {
                let builder = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(body);
                if stream {
                    builder.header("Accept", "text/event-stream")
                } else {
                    builder
                }
            })
            .await
    }

    fn into_chat_response(
        api: ApiResponse,
        latency: std::time::Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = tc
                    .function
                    .arguments
                    .map(|raw| raw.into_map(&tc.function.name))
                    .unwrap_or_default();
                ToolCall {
                    id: tc.id.filter(|id| !id.is_empty()).unwrap_or_else(ToolCall::generate_id),
                    name: tc.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice.finish_reason,
            usage: api
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
            model: api.model.unwrap_or_default(),
            latency,
        })
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
        sse::pump(&self.name, response, CompletionStream::new(&self.name), sink, cancel).await
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
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
        let api_response: ApiResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            parsed = response.json() => parsed.map_err(|e| {
                ProviderError::InvalidResponse(format!("Failed to parse response: {e}"))
            })?,
        };

        Self::into_chat_response(api_response, started.elapsed())
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

    async fn healthy(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Accumulates one streamed completion.
struct CompletionStream {
    provider: String,
    content: String,
    calls: BTreeMap<u32, PendingToolCall>,
    usage: Option<Usage>,
}

/// A tool call being assembled from deltas keyed by stream index.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
    ended: bool,
}

impl CompletionStream {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            content: String::new(),
            calls: BTreeMap::new(),
            usage: None,
        }
    }
}

impl StreamState for CompletionStream {
    fn on_frame(
        &mut self,
        frame: SseFrame,
        events: &mut Vec<StreamEvent>,
    ) -> Result<Flow, ProviderError> {
        let data = frame.data.trim();
        if data == "[DONE]" {
            return Ok(Flow::Stop);
        }

        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!(
                    provider = %self.provider,
                    data = %data,
                    error = %e,
                    "Ignoring unparseable SSE chunk"
                );
                return Ok(Flow::Continue);
            }
        };

        for choice in chunk.choices {
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let pending = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    pending.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        pending.name.push_str(&name);
                    }
                    if let Some(fragment) = function.arguments {
                        pending.arguments.push_str(&fragment);
                    }
                }
                if !pending.started && !pending.name.is_empty() {
                    if pending.id.is_empty() {
                        pending.id = ToolCall::generate_id();
                    }
                    pending.started = true;
                    events.push(StreamEvent::ToolStart {
                        id: pending.id.clone(),
                        name: pending.name.clone(),
                    });
                }
            }

            if let Some(text) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.content.push_str(&text);
                events.push(StreamEvent::Token { content: text });
            }

            if choice.finish_reason.is_some() {
                for pending in self.calls.values_mut() {
                    if pending.started && !pending.ended {
                        pending.ended = true;
                        events.push(StreamEvent::ToolEnd {
                            id: pending.id.clone(),
                            name: pending.name.clone(),
                        });
                    }
                }
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        Ok(Flow::Continue)
    }

    fn finish(self) -> StreamEvent {
        let provider = self.provider;
        let tool_calls = self
            .calls
            .into_values()
            .filter(|p| !p.name.is_empty())
            .map(|p| {
                let arguments = decode_arguments(&p.arguments, &p.name);
                let id = if p.id.is_empty() {
                    ToolCall::generate_id()
                } else {
                    p.id
                };
                ToolCall::new(id, p.name, arguments)
            })
            .collect::<Vec<_>>();

        debug!(provider = %provider, tool_calls = tool_calls.len(), "Stream finished");

        StreamEvent::Done {
            content: self.content,
            tool_calls,
            usage: self.usage,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ApiResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ApiResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Option<RawArguments>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.into(),
        }
    }

    fn run(frames: &[&str]) -> (Vec<StreamEvent>, StreamEvent) {
        let mut state = CompletionStream::new("test");
        let mut events = Vec::new();
        for data in frames {
            if state.on_frame(frame(data), &mut events).unwrap() == Flow::Stop {
                break;
            }
        }
        (events, state.finish())
    }

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url.contains("openrouter.ai"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider = OpenAiCompatProvider::new("custom", "http://localhost:8000/v1/", "");
        assert_eq!(provider.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn message_conversion_with_tool_calls() {
        let mut args = pincer_core::Arguments::new();
        args.insert("command".into(), serde_json::json!("ls"));
        let call = ToolCall::new("call_1", "shell", args);
        let msgs = vec![
            Message::assistant_with_tools("", vec![call.clone()]),
            Message::tool_result(&call, "file.txt"),
        ];

        let api_msgs = OpenAiCompatProvider::to_api_messages(&msgs);
        let tc = api_msgs[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].function.name, "shell");
        assert_eq!(tc[0].function.arguments, r#"{"command":"ls"}"#);
        assert_eq!(api_msgs[1].role, "tool");
        assert_eq!(api_msgs[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = OpenAiCompatProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].function.name, "shell");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn body_uses_model_override() {
        let provider = OpenAiCompatProvider::openai("sk").with_model("gpt-4o");
        let mut request = ChatRequest::new("ignored", vec![Message::user("hi")]);
        request.max_tokens = Some(64);
        let body = provider.build_body(&request, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn response_with_string_arguments() {
        let api: ApiResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc",
                            "type": "function",
                            "function": {"name": "shell", "arguments": "{\"command\":\"ls -la\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
            }"#,
        )
        .unwrap();

        let response = OpenAiCompatProvider::into_chat_response(api, Duration::ZERO).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.tool_calls[0].id, "call_abc");
        assert_eq!(response.tool_calls[0].arguments["command"], "ls -la");
        assert_eq!(response.usage.unwrap().total_tokens, 20);
    }

    #[test]
    fn response_with_non_object_arguments_still_decodes() {
        let api: ApiResponse = serde_json::from_str(
            r#"{
                "choices": [{
                    "message": {
                        "tool_calls": [
                            {"id": "a", "function": {"name": "shell", "arguments": {"cmd": "ls"}}},
                            {"id": "b", "function": {"name": "system_info", "arguments": []}},
                            {"id": "c", "function": {"name": "web_search", "arguments": 7}}
                        ]
                    }
                }]
            }"#,
        )
        .unwrap();

        let response = OpenAiCompatProvider::into_chat_response(api, Duration::ZERO).unwrap();
        assert_eq!(response.tool_calls.len(), 3);
        assert_eq!(response.tool_calls[0].arguments["cmd"], "ls");
        assert_eq!(response.tool_calls[1].name, "system_info");
        assert!(response.tool_calls[1].arguments.is_empty());
        assert!(response.tool_calls[2].arguments.is_empty());
    }

    #[test]
    fn response_with_object_arguments_and_no_id() {
        let api: ApiResponse = serde_json::from_str(
            r#"{
                "choices": [{
                    "message": {
                        "content": "",
                        "tool_calls": [
                            {"function": {"name": "web_search", "arguments": {"query": "rust"}}}
                        ]
                    }
                }]
            }"#,
        )
        .unwrap();

        let response = OpenAiCompatProvider::into_chat_response(api, Duration::ZERO).unwrap();
        let call = &response.tool_calls[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.arguments["query"], "rust");
    }

    #[test]
    fn response_without_choices_is_invalid() {
        let api: ApiResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let err = OpenAiCompatProvider::into_chat_response(api, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn stream_text_tokens() {
        let (events, done) = run(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "[DONE]",
        ]);

        assert_eq!(
            events,
            vec![
                StreamEvent::Token { content: "Hel".into() },
                StreamEvent::Token { content: "lo".into() },
            ]
        );
        match done {
            StreamEvent::Done { content, tool_calls, usage } => {
                assert_eq!(content, "Hello");
                assert!(tool_calls.is_empty());
                assert_eq!(usage, Some(Usage::new(10, 5)));
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn stream_tool_call_accumulation() {
        let (events, done) = run(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"shell","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"comm"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"web_search","arguments":"{\"query\":\"x\"}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["tool_start", "tool_start", "tool_end", "tool_end"]);

        match done {
            StreamEvent::Done { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 2);
                assert_eq!(tool_calls[0].id, "call_a");
                assert_eq!(tool_calls[0].arguments["command"], "ls");
                assert_eq!(tool_calls[1].name, "web_search");
                assert_eq!(tool_calls[1].arguments["query"], "x");
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn stream_malformed_arguments_yield_empty_map() {
        let (_, done) = run(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"shell","arguments":"{\"command\":"}}]},"finish_reason":null}]}"#,
        ]);
        match done {
            StreamEvent::Done { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 1);
                assert!(tool_calls[0].arguments.is_empty());
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn stream_ignores_garbage_frames() {
        let (events, done) = run(&["not json", r#"{"choices":[{"delta":{"content":"ok"}}]}"#]);
        assert_eq!(events.len(), 1);
        assert!(matches!(done, StreamEvent::Done { content, .. } if content == "ok"));
    }
}
