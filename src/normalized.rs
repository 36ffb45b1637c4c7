//! Normalized event types for streaming model turns.
//!
//! Both model backends (Gemini and OpenRouter) are decoded into the same
//! [`NormalizedEvent`] stream, and the orchestrator adds the tool lifecycle
//! and turn boundaries on top. The chat front end only ever sees this enum.
//!
//! # Example
//!
//! ```rust
//! use gemini_mcp_agent::normalized::{NormalizedEvent, event_name};
//!
//! let event = NormalizedEvent::MessageDelta {
//!     text: "Hello".to_string(),
//! };
//! assert_eq!(event_name(&event), "message.delta");
//! ```

use serde::{Deserialize, Serialize};

/// Error codes attached to [`NormalizedEvent::Error`].
pub mod codes {
    pub const RECURSION_LIMIT: &str = "RECURSION_LIMIT";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const TOOL_LOOP: &str = "TOOL_LOOP";
    pub const CANCELLED: &str = "CANCELLED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const AUTH: &str = "AUTH";
    pub const LLM_ERROR: &str = "LLM_ERROR";
}

/// Streaming events emitted by model drivers and the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NormalizedEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Turn Lifecycle
    // ─────────────────────────────────────────────────────────────────────
    /// A new turn started.
    #[serde(rename = "stream.start")]
    StreamStart {
        /// Unique identifier for this turn.
        request_id: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Message Content
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental text from the assistant.
    #[serde(rename = "message.delta")]
    MessageDelta { text: String },

    // ─────────────────────────────────────────────────────────────────────
    // Tool Calls
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental tool call fragment (chat-completions streaming).
    #[serde(rename = "tool_call.delta")]
    ToolCallDelta {
        call_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_delta: Option<String>,
    },

    /// Tool call is fully assembled and ready for execution.
    #[serde(rename = "tool_call.complete")]
    ToolCallComplete {
        call_index: usize,
        id: String,
        name: String,
        /// Complete arguments as a JSON string.
        arguments_json: String,
    },

    /// Result from executing a tool.
    #[serde(rename = "tool_result")]
    ToolResult {
        id: String,
        name: String,
        content: String,
        #[serde(default = "default_true")]
        success: bool,
    },

    /// The same tool call keeps repeating within one turn.
    #[serde(rename = "loop.warning")]
    LoopWarning { tool: String, count: usize },

    // ─────────────────────────────────────────────────────────────────────
    // Errors and Completion
    // ─────────────────────────────────────────────────────────────────────
    #[serde(rename = "error")]
    Error {
        message: String,
        /// See [`codes`].
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// The turn (or a single model round, when emitted by a driver) ended.
    #[serde(rename = "done")]
    Done,
}

fn default_true() -> bool {
    true
}

impl NormalizedEvent {
    /// Build an error event with a code from [`codes`].
    #[must_use]
    pub fn error(message: impl Into<String>, code: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Stable name for a [`NormalizedEvent`], used in logs.
pub fn event_name(evt: &NormalizedEvent) -> &'static str {
    match evt {
        NormalizedEvent::StreamStart { .. } => "stream.start",
        NormalizedEvent::MessageDelta { .. } => "message.delta",
        NormalizedEvent::ToolCallDelta { .. } => "tool_call.delta",
        NormalizedEvent::ToolCallComplete { .. } => "tool_call.complete",
        NormalizedEvent::ToolResult { .. } => "tool_result",
        NormalizedEvent::LoopWarning { .. } => "loop.warning",
        NormalizedEvent::Error { .. } => "error",
        NormalizedEvent::Done => "done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_delta_serialization() {
        let event = NormalizedEvent::MessageDelta {
            text: "Hello".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("message.delta"));
        assert!(json.contains("Hello"));
    }

    #[test]
    fn test_error_event_carries_code() {
        let event = NormalizedEvent::error("too many rounds", codes::RECURSION_LIMIT);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "RECURSION_LIMIT");
        assert_eq!(event_name(&event), "error");
    }

    #[test]
    fn test_tool_result_success_defaults_to_true() {
        let event: NormalizedEvent = serde_json::from_str(
            r#"{"type":"tool_result","data":{"id":"1","name":"fs__read","content":"ok"}}"#,
        )
        .unwrap();
        assert!(matches!(event, NormalizedEvent::ToolResult { success: true, .. }));
    }
}
