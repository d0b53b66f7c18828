//! Chat-completions client for the planner's tool loop.
//!
//! Speaks the OpenAI wire format (messages, tool definitions, tool calls,
//! usage accounting) over reqwest. The `ChatClient` trait is the seam the
//! planner tests mock.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    /// Chat-completions endpoint base, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1500,
            temperature: 0.7,
            timeout_seconds: 120,
            max_retries: 3,
            initial_retry_delay_ms: 250,
            max_retry_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// One assistant turn plus the tokens it cost.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: ChatMessage,
    pub total_tokens: i64,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, LlmError>;
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
}

pub struct OpenAiChatClient {
    config: LlmConfig,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::Config("API key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { config, client })
    }

    async fn send_once(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let wire = WireRequest {
            model: &self.config.model,
            messages: &request.messages,
            tools: &request.tools,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        debug!(model = %self.config.model, messages = request.messages.len(), "Sending chat request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&wire)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;

        Ok(ChatCompletion {
            message: choice.message,
            total_tokens: parsed.usage.total_tokens,
        })
    }

    fn is_retryable(error: &LlmError) -> bool {
        match error {
            LlmError::Http(e) => e.is_timeout() || e.is_connect(),
            // Rate limits and server-side failures clear up on their own.
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, LlmError> {
        let mut attempt = 0;
        let mut delay_ms = self.config.initial_retry_delay_ms;

        loop {
            match self.send_once(&request).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries || !Self::is_retryable(&e) {
                        return Err(e);
                    }
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms,
                        error = %e,
                        "Chat request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(self.config.max_retry_delay_ms);
                }
            }
        }
    }
}

/// Scripted client for planner tests: each queued message is one
/// assistant turn, consumed in order.
pub struct MockChatClient {
    turns: Mutex<VecDeque<ChatMessage>>,
    tokens_per_turn: i64,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl MockChatClient {
    pub fn new(tokens_per_turn: i64) -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            tokens_per_turn,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_turn(&self, message: ChatMessage) {
        self.turns.lock().unwrap().push_back(message);
    }

    /// Queues an assistant turn containing a single tool call.
    pub fn queue_tool_call(&self, call_id: &str, tool: &str, arguments: serde_json::Value) {
        self.queue_turn(ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: call_id.to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: tool.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
            tool_call_id: None,
        });
    }

    /// Queues a plain text turn with no tool calls.
    pub fn queue_text(&self, content: &str) {
        self.queue_turn(ChatMessage {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.requests.lock().unwrap().push(request);

        let message = self.turns.lock().unwrap().pop_front().ok_or_else(|| {
            LlmError::MalformedResponse("mock client has no scripted turns left".to_string())
        })?;

        Ok(ChatCompletion {
            message,
            total_tokens: self.tokens_per_turn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requires_an_api_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            OpenAiChatClient::new(config),
            Err(LlmError::Config(_))
        ));

        let config = LlmConfig {
            api_key: "sk-test".to_string(),
            ..LlmConfig::default()
        };
        assert!(OpenAiChatClient::new(config).is_ok());
    }

    #[test]
    fn retryable_errors_are_transient_ones() {
        assert!(OpenAiChatClient::is_retryable(&LlmError::Api {
            status: 429,
            message: String::new(),
        }));
        assert!(OpenAiChatClient::is_retryable(&LlmError::Api {
            status: 503,
            message: String::new(),
        }));
        assert!(!OpenAiChatClient::is_retryable(&LlmError::Api {
            status: 401,
            message: String::new(),
        }));
        assert!(!OpenAiChatClient::is_retryable(&LlmError::MalformedResponse(
            String::new()
        )));
    }

    #[tokio::test]
    async fn mock_client_replays_scripted_turns() {
        let mock = MockChatClient::new(100);
        mock.queue_text("first");
        mock.queue_tool_call("call-1", "clear_hints", serde_json::json!({"reason": "noise"}));

        let request = ChatRequest {
            messages: vec![ChatMessage::user("go")],
            tools: vec![],
        };

        let first = mock.complete(request.clone()).await.unwrap();
        assert_eq!(first.message.content.as_deref(), Some("first"));
        assert_eq!(first.total_tokens, 100);

        let second = mock.complete(request.clone()).await.unwrap();
        let calls = second.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "clear_hints");

        assert!(mock.complete(request).await.is_err());
        assert_eq!(mock.requests.lock().unwrap().len(), 3);
    }
}
