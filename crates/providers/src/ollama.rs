//! Local chat server provider (Ollama `/api/chat`).
//!
//! The wire schema mirrors chat completions with two differences: tool-call
//! arguments are always JSON objects, and calls carry no ids, so ids are
//! generated on receipt. Streaming is not offered; the failover chain
//! synthesizes a stream from the complete response when needed.

use std::time::Instant;

use async_trait::async_trait;
use pincer_core::error::ProviderError;
use pincer_core::message::{Arguments, Message, Role, ToolCall};
use pincer_core::provider::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arguments::RawArguments;
use crate::retry::RetryExecutor;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    name: String,
    base_url: String,
    model: Option<String>,
    client: reqwest::Client,
    retry: RetryExecutor,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            name: "ollama".into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: None,
            client: crate::router::http_client(),
            retry: RetryExecutor::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn to_api_messages(messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.as_str().into(),
                content: m.content.clone(),
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|tc| OllamaToolCall {
                        function: OllamaFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect(),
                tool_name: match m.role {
                    Role::Tool => m.tool_name.clone(),
                    _ => None,
                },
            })
            .collect()
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let model = self.model.as_deref().unwrap_or(&request.model);
        let mut options = serde_json::json!({ "temperature": request.temperature });
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = serde_json::json!(max_tokens);
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": false,
            "options": options,
        });

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        body
    }

    fn into_chat_response(resp: OllamaResponse, latency: std::time::Duration) -> ChatResponse {
        let tool_calls = resp
            .message
            .tool_calls
            .into_iter()
            .filter(|tc| !tc.function.name.is_empty())
            .map(|tc| {
                let arguments = tc
                    .function
                    .arguments
                    .map(|raw| raw.into_map(&tc.function.name))
                    .unwrap_or_default();
                ToolCall::new(ToolCall::generate_id(), tc.function.name, arguments)
            })
            .collect();

        let usage = match (resp.prompt_eval_count, resp.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0))),
        };

        ChatResponse {
            content: resp.message.content,
            tool_calls,
            finish_reason: resp.done_reason,
            usage,
            model: resp.model,
            latency,
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_body(&request);

        debug!(provider = %self.name, model = %request.model, "Sending chat request");

        let response = self
            .retry
            .execute(&self.name, cancel, || self.client.post(&url).json(&body))
            .await?;

        let api_resp: OllamaResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            parsed = response.json() => parsed.map_err(|e| {
                ProviderError::InvalidResponse(format!("Failed to parse Ollama response: {e}"))
            })?,
        };

        Ok(Self::into_chat_response(api_resp, started.elapsed()))
    }

    /// Reachability probe against the local model listing.
    async fn healthy(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }
}

// --- Ollama API types ---

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Serialize)]
struct OllamaFunction {
    name: String,
    arguments: Arguments,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseToolCall {
    function: OllamaResponseFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Option<RawArguments>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_base_url() {
        let provider = OllamaProvider::new(None);
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
        assert!(!provider.supports_streaming());
    }

    #[test]
    fn body_maps_sampling_options() {
        let provider = OllamaProvider::new(Some("http://gpu-box:11434/")).with_model("llama3.1");
        let mut request = ChatRequest::new("ignored", vec![Message::user("hi")]);
        request.max_tokens = Some(256);
        request.temperature = 0.2;

        let body = provider.build_body(&request);
        assert_eq!(provider.base_url, "http://gpu-box:11434");
        assert_eq!(body["model"], "llama3.1");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 256);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_result_carries_tool_name() {
        let call = ToolCall::new("call_1", "system_info", Arguments::new());
        let api = OllamaProvider::to_api_messages(&[
            Message::assistant_with_tools("", vec![call.clone()]),
            Message::tool_result(&call, "linux x86_64"),
        ]);
        assert_eq!(api[0].tool_calls.len(), 1);
        assert_eq!(api[1].role, "tool");
        assert_eq!(api[1].tool_name.as_deref(), Some("system_info"));
    }

    #[test]
    fn response_tool_calls_get_ids() {
        let resp: OllamaResponse = serde_json::from_str(
            r#"{
                "model": "llama3.1",
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [
                        {"function": {"name": "web_search", "arguments": {"query": "rust"}}}
                    ]
                },
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 30,
                "eval_count": 12
            }"#,
        )
        .unwrap();

        let response = OllamaProvider::into_chat_response(resp, Duration::ZERO);
        assert_eq!(response.tool_calls.len(), 1);
        assert!(response.tool_calls[0].id.starts_with("call_"));
        assert_eq!(response.tool_calls[0].arguments["query"], "rust");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 42);
    }

    #[test]
    fn response_with_array_arguments_still_decodes() {
        let resp: OllamaResponse = serde_json::from_str(
            r#"{
                "model": "llama3.1",
                "message": {
                    "content": "",
                    "tool_calls": [
                        {"function": {"name": "system_info", "arguments": ["all"]}},
                        {"function": {"name": "shell", "arguments": {"command": "uptime"}}}
                    ]
                }
            }"#,
        )
        .unwrap();

        let response = OllamaProvider::into_chat_response(resp, Duration::ZERO);
        assert_eq!(response.tool_calls.len(), 2);
        assert!(response.tool_calls[0].arguments.is_empty());
        assert_eq!(response.tool_calls[1].arguments["command"], "uptime");
    }

    #[test]
    fn response_without_counts_has_no_usage() {
        let resp: OllamaResponse =
            serde_json::from_str(r#"{"model": "m", "message": {"content": "hello"}}"#).unwrap();
        let response = OllamaProvider::into_chat_response(resp, Duration::ZERO);
        assert_eq!(response.content, "hello");
        assert!(response.usage.is_none());
    }
}
