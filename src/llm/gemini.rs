//! Google Gemini driver.
//!
//! Talks to `models/{model}:streamGenerateContent?alt=sse`. Conversation
//! history arrives in the OpenAI shape and is converted here:
//!
//! - system messages become `systemInstruction`
//! - assistant messages become `model` contents with `functionCall` parts
//! - consecutive tool messages are grouped into one `user` content of
//!   `functionResponse` parts, named by looking up the originating call id
//!
//! Gemini sends each function call whole, so the driver emits
//! [`NormalizedEvent::ToolCallComplete`] directly with a synthetic call id.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::normalized::NormalizedEvent;
use crate::sse::SseDecoder;

use super::{
    EventStream, LlmDriver, LlmError, LlmRequest, LlmSettings, Message, MessageRole,
    ModelProvider, ToolSpec,
};

/// Schema keys the Gemini API rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "additionalProperties",
    "$ref",
    "$defs",
    "definitions",
    "default",
    "examples",
];

/// Driver for the Gemini API.
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl GeminiDriver {
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: &LlmRequest) -> Value {
        let (system, contents) = to_gemini_contents(&req.messages);
        let mut body = json!({
            "contents": contents,
            "generationConfig": { "temperature": self.settings.temperature },
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !req.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": req.tools.iter().map(function_declaration).collect::<Vec<_>>()
            }]);
        }
        body
    }
}

/// Convert OpenAI-shaped history into Gemini `contents`.
///
/// Returns the joined system text, if any, and the content list.
pub fn to_gemini_contents(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Vec<&str> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut pending_responses: Vec<Value> = Vec::new();

    let flush = |pending: &mut Vec<Value>, contents: &mut Vec<Value>| {
        if !pending.is_empty() {
            contents.push(json!({ "role": "user", "parts": std::mem::take(pending) }));
        }
    };

    for msg in messages {
        if msg.role != MessageRole::Tool {
            flush(&mut pending_responses, &mut contents);
        }
        match msg.role {
            MessageRole::System => {
                if !msg.content.trim().is_empty() {
                    system.push(&msg.content);
                }
            }
            MessageRole::User => {
                contents.push(json!({ "role": "user", "parts": [{ "text": msg.content }] }));
            }
            MessageRole::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({ "text": msg.content }));
                }
                for tc in msg.tool_calls.iter().flatten() {
                    call_names.insert(&tc.id, &tc.function.name);
                    let args: Value = serde_json::from_str(&tc.function.arguments)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({}));
                    parts.push(json!({
                        "functionCall": { "name": tc.function.name, "args": args }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            MessageRole::Tool => {
                let name = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id).copied())
                    .unwrap_or("unknown_tool");
                pending_responses.push(json!({
                    "functionResponse": {
                        "name": name,
                        "response": { "name": name, "content": msg.content }
                    }
                }));
            }
        }
    }
    flush(&mut pending_responses, &mut contents);

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, contents)
}

/// Gemini function declaration for a tool, with its schema cleaned.
pub fn function_declaration(tool: &ToolSpec) -> Value {
    let mut decl = json!({ "name": tool.name, "description": tool.description });
    let params = clean_schema(&tool.parameters);
    let has_properties = params
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|p| !p.is_empty());
    if has_properties {
        decl["parameters"] = params;
    }
    decl
}

/// Strip schema keys Gemini rejects and collapse nullable type unions.
pub fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                if UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()) {
                    continue;
                }
                let cleaned = match (k.as_str(), v) {
                    // ["string", "null"] -> "string"
                    ("type", Value::Array(types)) => types
                        .iter()
                        .find(|t| t.as_str() != Some("null"))
                        .cloned()
                        .unwrap_or_else(|| Value::String("string".to_string())),
                    // property names are user data, only their schemas are cleaned
                    ("properties", Value::Object(props)) => Value::Object(
                        props
                            .iter()
                            .map(|(name, s)| (name.clone(), clean_schema(s)))
                            .collect(),
                    ),
                    _ => clean_schema(v),
                };
                out.insert(k.clone(), cleaned);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Incremental decoder for Gemini `GenerateContentResponse` chunks.
#[derive(Debug, Default)]
pub(crate) struct ChunkParser {
    call_index: usize,
}

impl ChunkParser {
    pub(crate) fn handle_data(&mut self, data: &str) -> Result<Vec<NormalizedEvent>, LlmError> {
        let mut out = Vec::new();
        let data = data.trim();
        if data.is_empty() {
            return Ok(out);
        }

        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            return Err(LlmError::from_stream_error(ModelProvider::Gemini, err));
        }

        let candidate = v.get("candidates").and_then(|c| c.get(0));
        if candidate.is_none() {
            if let Some(reason) = v
                .get("promptFeedback")
                .and_then(|f| f.get("blockReason"))
                .and_then(Value::as_str)
            {
                return Err(LlmError::Blocked(reason.to_string()));
            }
            return Ok(out);
        }

        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array);

        for part in parts.into_iter().flatten() {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(NormalizedEvent::MessageDelta {
                        text: text.to_string(),
                    });
                }
            }
            if let Some(call) = part.get("functionCall") {
                let Some(name) = call.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                out.push(NormalizedEvent::ToolCallComplete {
                    call_index: self.call_index,
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    name: name.to_string(),
                    arguments_json: args.to_string(),
                });
                self.call_index += 1;
            }
        }

        if let Some(reason) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
        {
            match reason {
                "STOP" | "MAX_TOKENS" | "FINISH_REASON_UNSPECIFIED" => {
                    if reason == "MAX_TOKENS" {
                        tracing::warn!("Gemini response truncated at max tokens");
                    }
                }
                other => {
                    tracing::warn!(finish_reason = other, "Gemini stopped early");
                    if out.is_empty() && self.call_index == 0 {
                        return Err(LlmError::Blocked(other.to_string()));
                    }
                }
            }
        }

        Ok(out)
    }
}

#[async_trait::async_trait]
impl LlmDriver for GeminiDriver {
    async fn stream(&self, req: LlmRequest) -> Result<EventStream, LlmError> {
        let url = self
            .settings
            .provider
            .build_stream_url(&self.settings.base_url, &self.settings.model);
        let body = self.request_body(&req);

        tracing::debug!(
            model = %self.settings.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "Sending Gemini request"
        );

        let send = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(self.settings.request_timeout, send)
            .await
            .map_err(|_| LlmError::Timeout {
                after: self.settings.request_timeout,
            })??;
        let resp = super::check_response(ModelProvider::Gemini, resp).await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            let mut parser = ChunkParser::default();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                for frame in decoder.push(&chunk) {
                    for event in parser.handle_data(&frame.data)? {
                        yield event;
                    }
                }
            }
            if let Some(frame) = decoder.finish() {
                for event in parser.handle_data(&frame.data)? {
                    yield event;
                }
            }
            yield NormalizedEvent::Done;
        };

        Ok(Box::pin(out))
    }
}
