//! OpenAI-compatible chat-completions wire client.
//!
//! Every backend speaks this dialect: hosted OpenAI natively, Ollama and
//! the local servers through their `/v1` compatibility endpoints. The
//! client knows nothing about tools or prompts; it sends a request body
//! and maps transport failures onto [`LlmError`].

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Deadline for a single LLM call.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call echoed back into the conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: OutboundFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundFunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as stored on the task.
    pub arguments: String,
}

/// One chat message. Only the fields relevant to the role are set.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OutboundToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn that carried a tool call. The protocol requires this
    /// message before the matching tool-result message.
    pub fn assistant_tool_call(
        content: Option<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: Some(vec![OutboundToolCall {
                id: id.into(),
                call_type: "function",
                function: OutboundFunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            }]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(id.into()),
        }
    }
}

/// Declared tool schema for tool-call-capable providers.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format: &'static str,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            format: "json_object",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<InboundToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct InboundToolCall {
    pub id: String,
    pub function: InboundFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct InboundFunctionCall {
    pub name: String,
    /// JSON-encoded arguments as returned by the model.
    pub arguments: String,
}

/// Chat-completions client bound to one endpoint.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    provider: &'static str,
}

impl ChatClient {
    pub fn new(
        provider: &'static str,
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            provider,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    /// Send one chat request. No retries; callers own their fallback.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = self.chat_url();
        tracing::debug!(provider = self.provider, %url, model = %request.model, "sending chat request");

        let mut builder = self.http.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    provider: self.provider.to_string(),
                    timeout: LLM_TIMEOUT,
                }
            } else {
                LlmError::RequestFailed {
                    provider: self.provider.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: self.provider.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: self.provider.to_string(),
                    retry_after: None,
                },
                _ => LlmError::RequestFailed {
                    provider: self.provider.to_string(),
                    reason: format!("HTTP {status}: {}", truncate_for_preview(&body, 512)),
                },
            });
        }

        serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
            provider: self.provider.to_string(),
            reason: format!(
                "JSON parse error: {e}. Raw: {}",
                truncate_for_preview(&body, 512)
            ),
        })
    }
}

/// Shorten a string for log/error output, respecting char boundaries.
pub fn truncate_for_preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect::<String>() + "..."
}
