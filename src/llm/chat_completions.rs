//! OpenAI-compatible Chat Completions driver (OpenRouter).
//!
//! Implements [`LlmDriver`] against `{base}/chat/completions` with
//! `stream: true`, assembling streamed tool call fragments.

use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::{Value, json};

use crate::normalized::NormalizedEvent;
use crate::sse::SseDecoder;

use super::{EventStream, LlmDriver, LlmError, LlmRequest, LlmSettings, ModelProvider, ToolSpec};

const APP_REFERER: &str = "https://github.com/gemini-mcp-agent";
const APP_TITLE: &str = "Gemini MCP Agent";

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Incremental decoder for chat-completions `data:` payloads.
#[derive(Debug, Default)]
pub(crate) struct ChunkParser {
    tool_accum: BTreeMap<usize, ToolAccum>,
    tools_emitted: bool,
    done: bool,
}

impl ChunkParser {
    /// Handle one `data:` payload.
    pub(crate) fn handle_data(&mut self, data: &str) -> Result<Vec<NormalizedEvent>, LlmError> {
        let mut out = Vec::new();
        let data = data.trim();
        if data.is_empty() {
            return Ok(out);
        }
        if data == "[DONE]" {
            self.flush_tools(&mut out);
            if !self.done {
                self.done = true;
                out.push(NormalizedEvent::Done);
            }
            return Ok(out);
        }

        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            return Err(LlmError::from_stream_error(ModelProvider::OpenRouter, err));
        }

        let Some(choice) = v.get("choices").and_then(|c| c.get(0)) else {
            return Ok(out);
        };
        let delta = &choice["delta"];

        if let Some(s) = delta.get("content").and_then(Value::as_str) {
            if !s.is_empty() {
                out.push(NormalizedEvent::MessageDelta {
                    text: s.to_string(),
                });
            }
        }

        if let Some(arr) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in arr {
                let idx = tc
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|i| usize::try_from(i).ok())
                    .unwrap_or(0);
                let id = tc.get("id").and_then(Value::as_str).map(ToString::to_string);
                let function = tc.get("function");
                let name = function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let args_delta = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string);

                let entry = self.tool_accum.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id.clone_from(&id);
                }
                if entry.name.is_none() {
                    entry.name.clone_from(&name);
                }
                if let Some(ad) = &args_delta {
                    entry.args.push_str(ad);
                }

                out.push(NormalizedEvent::ToolCallDelta {
                    call_index: idx,
                    id,
                    name,
                    arguments_delta: args_delta,
                });
            }
        }

        // Some upstream models finish with "stop" even after tool calls.
        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            self.flush_tools(&mut out);
        }

        Ok(out)
    }

    /// Called when the byte stream ends.
    pub(crate) fn finish(&mut self) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        self.flush_tools(&mut out);
        if !self.done {
            self.done = true;
            out.push(NormalizedEvent::Done);
        }
        out
    }

    fn flush_tools(&mut self, out: &mut Vec<NormalizedEvent>) {
        if self.tools_emitted {
            return;
        }
        self.tools_emitted = !self.tool_accum.is_empty();
        for (idx, a) in &self.tool_accum {
            if let Some(name) = &a.name {
                out.push(NormalizedEvent::ToolCallComplete {
                    call_index: *idx,
                    id: a.id.clone().unwrap_or_else(|| format!("call_{idx}")),
                    name: name.clone(),
                    arguments_json: if a.args.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        a.args.clone()
                    },
                });
            }
        }
    }
}

/// Driver for OpenRouter's chat completions endpoint.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: &LlmRequest) -> Result<Value, LlmError> {
        let mut body = json!({
            "model": self.settings.model,
            "stream": true,
            "temperature": self.settings.temperature,
            "messages": serde_json::to_value(&req.messages)?,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_json).collect());
        }
        Ok(body)
    }
}

fn tool_json(t: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        }
    })
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> Result<EventStream, LlmError> {
        let url = self
            .settings
            .provider
            .build_stream_url(&self.settings.base_url, &self.settings.model);
        let body = self.request_body(&req)?;

        tracing::debug!(
            url = %url,
            model = %self.settings.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "Sending chat completions request"
        );

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(self.settings.request_timeout, send)
            .await
            .map_err(|_| LlmError::Timeout {
                after: self.settings.request_timeout,
            })??;
        let resp = super::check_response(ModelProvider::OpenRouter, resp).await?;
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
            for event in parser.finish() {
                yield event;
            }
        };

        Ok(Box::pin(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    fn run(parser: &mut ChunkParser, payloads: &[&str]) -> Vec<NormalizedEvent> {
        payloads
            .iter()
            .flat_map(|p| parser.handle_data(p).unwrap())
            .collect()
    }

    #[test]
    fn test_text_stream() {
        let mut parser = ChunkParser::default();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
                r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );
        assert_eq!(
            events,
            vec![
                NormalizedEvent::MessageDelta { text: "Hel".into() },
                NormalizedEvent::MessageDelta { text: "lo".into() },
                NormalizedEvent::Done,
            ]
        );
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_tool_call_accumulation() {
        let mut parser = ChunkParser::default();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"filesystem__read_file","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a.txt\"}"}}]}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );
        let complete: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, NormalizedEvent::ToolCallComplete { .. }))
            .collect();
        assert_eq!(
            complete,
            vec![&NormalizedEvent::ToolCallComplete {
                call_index: 0,
                id: "call_a".into(),
                name: "filesystem__read_file".into(),
                arguments_json: r#"{"path":"a.txt"}"#.into(),
            }]
        );
        assert_eq!(events.last(), Some(&NormalizedEvent::Done));
    }

    #[test]
    fn test_tools_flushed_when_stream_ends_without_finish_reason() {
        let mut parser = ChunkParser::default();
        run(
            &mut parser,
            &[r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"x","function":{"name":"t"}}]}}]}"#],
        );
        let tail = parser.finish();
        assert!(matches!(
            &tail[0],
            NormalizedEvent::ToolCallComplete { arguments_json, .. } if arguments_json == "{}"
        ));
        assert_eq!(tail[1], NormalizedEvent::Done);
    }

    #[test]
    fn test_inline_error_is_mapped() {
        let mut parser = ChunkParser::default();
        let err = parser
            .handle_data(r#"{"error":{"code":429,"message":"Rate limit exceeded"}}"#)
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { provider: "OpenRouter", .. }));
    }

    #[test]
    fn test_request_body_shape() {
        let driver = ChatCompletionsDriver::new(LlmSettings {
            provider: ModelProvider::OpenRouter,
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key: "k".into(),
            model: "openai/gpt-4o-mini".into(),
            temperature: 0.2,
            request_timeout: std::time::Duration::from_secs(30),
        });
        let body = driver
            .request_body(&LlmRequest {
                messages: vec![Message::system("sys"), Message::user("hi")],
                tools: vec![ToolSpec {
                    name: "fetch__fetch".into(),
                    description: "Fetch a URL".into(),
                    parameters: json!({"type": "object", "properties": {"url": {"type": "string"}}}),
                }],
            })
            .unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "fetch__fetch");

        let no_tools = driver
            .request_body(&LlmRequest {
                messages: vec![Message::user("hi")],
                tools: vec![],
            })
            .unwrap();
        assert!(no_tools.get("tools").is_none());
    }
}
