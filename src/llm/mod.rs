//! Model backends and the tool loop.
//!
//! The [`LlmDriver`] trait is the streaming seam every backend implements.
//! The [`Orchestrator`] builds on top of a driver to run the tool loop.
//!
//! # Drivers
//!
//! - [`GeminiDriver`]: Google Gemini `streamGenerateContent`
//! - [`ChatCompletionsDriver`]: OpenRouter (OpenAI-compatible `/chat/completions`)
//!
//! History is kept in the OpenAI message shape; the Gemini driver converts it
//! on the way out.

pub mod chat_completions;
pub mod gemini;
pub mod orchestrator;
pub mod provider;

pub use chat_completions::ChatCompletionsDriver;
pub use gemini::GeminiDriver;
pub use orchestrator::{Orchestrator, OrchestratorOptions, TurnOutcome};

pub use crate::config::ModelProvider;

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use reqwest::header::RETRY_AFTER;
use thiserror::Error;

use crate::config::{AgentConfig, ConfigError};
use crate::normalized::NormalizedEvent;
use crate::resilience::{
    DEFAULT_RATE_LIMIT_DELAY, RetryDecision, Retryable, delay_from_secs, extract_retry_delay,
};

const MAX_ERROR_BODY: usize = 2000;

/// Model connection settings.
#[derive(Clone)]
pub struct LlmSettings {
    pub provider: ModelProvider,
    /// Base URL without a trailing slash.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Bound on establishing a streaming response.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl LlmSettings {
    /// Build settings from the agent configuration and the process environment.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self, ConfigError> {
        Self::from_config_with(cfg, |key| std::env::var(key).ok())
    }

    pub fn from_config_with<F>(cfg: &AgentConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = cfg.agent.model_provider;
        let api_key = lookup(provider.api_key_env())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingApiKey(provider.api_key_env()))?;
        let base_url = lookup(provider.base_url_env())
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            provider,
            base_url,
            api_key,
            model: cfg.agent.model_name.clone(),
            temperature: cfg.agent.temperature,
            request_timeout: cfg.request_timeout(),
        })
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Set on tool responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that request tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant message that requests tool calls.
    #[must_use]
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

impl ToolCall {
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a JSON string.
    pub arguments: String,
}

/// Provider-neutral tool declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} rate limit exceeded")]
    RateLimited {
        provider: &'static str,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode model response: {0}")]
    Decode(String),

    #[error("response blocked: {0}")]
    Blocked(String),

    #[error("no response within {}s", .after.as_secs())]
    Timeout { after: Duration },
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl LlmError {
    /// Build the error for a non-success HTTP status.
    #[must_use]
    pub fn from_status(
        provider: ModelProvider,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Self {
        let body = truncate(body, MAX_ERROR_BODY);
        match status {
            429 => Self::RateLimited {
                provider: provider.display_name(),
                retry_after: retry_after.or_else(|| extract_retry_delay(&body)),
                body,
            },
            401 | 403 => Self::Auth { status, body },
            _ => Self::Api { status, body },
        }
    }

    /// Map an `{"error": {...}}` object embedded in a stream.
    #[must_use]
    pub fn from_stream_error(provider: ModelProvider, error: &serde_json::Value) -> Self {
        let status = error
            .get("code")
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        let status = match error.get("status").and_then(serde_json::Value::as_str) {
            Some("RESOURCE_EXHAUSTED") => 429,
            _ => status,
        };
        Self::from_status(provider, status, None, &error.to_string())
    }
}

impl Retryable for LlmError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::RateLimited { retry_after, .. } => {
                RetryDecision::RetryAfter(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_DELAY))
            }
            Self::Http(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                RetryDecision::Retry
            }
            Self::Api { status, .. } if *status >= 500 => RetryDecision::Retry,
            Self::Timeout { .. } => RetryDecision::Retry,
            _ => RetryDecision::Stop,
        }
    }
}

/// Fail non-success responses with the mapped [`LlmError`].
pub(crate) async fn check_response(
    provider: ModelProvider,
    resp: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = retry_after_header(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::from_status(
        provider,
        status.as_u16(),
        retry_after,
        &body,
    ))
}

/// `Retry-After` given in seconds, capped like any other server hint.
fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(delay_from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Stream of events from one model round.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<NormalizedEvent, LlmError>> + Send>>;

/// Streaming model backend.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Start one model round.
    ///
    /// Errors returned here happen before any event was produced and are
    /// safe to retry.
    async fn stream(&self, req: LlmRequest) -> Result<EventStream, LlmError>;
}
