//! Tool loop.
//!
//! One chat turn with the [`Orchestrator`]:
//! 1. Send the history and tool declarations to the model
//! 2. Stream the response, collecting completed tool calls
//! 3. Execute the tool calls through the MCP registry
//! 4. Feed the results back to the model
//! 5. Repeat until the model answers without tools
//!
//! Every wait is bounded: the model request and stream by `request_timeout`,
//! each tool call by `tool_timeout`, the round count by `recursion_limit`.
//! The cancellation token is honoured at every await point.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::mcp::McpRegistry;
use crate::normalized::{NormalizedEvent, codes};
use crate::resilience::{RetryPolicy, retry_with_backoff, timeout_stream};

use super::{
    ChatCompletionsDriver, GeminiDriver, LlmDriver, LlmError, LlmRequest, LlmSettings, Message,
    ModelProvider, ToolCall,
};

/// Identical tool calls allowed in one turn before it is stopped.
pub const MAX_TOOL_REPEATS: usize = 10;

/// Attempts at starting a model round, including the first.
pub const MAX_RETRY_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub recursion_limit: usize,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
    pub retry: RetryPolicy,
}

impl OrchestratorOptions {
    #[must_use]
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            recursion_limit: cfg.agent.recursion_limit,
            request_timeout: cfg.request_timeout(),
            tool_timeout: cfg.tool_timeout(),
            retry: RetryPolicy {
                max_attempts: MAX_RETRY_ATTEMPTS,
                ..RetryPolicy::default()
            },
        }
    }
}

/// What a turn produced, for persisting in conversation memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    /// Assistant and tool messages appended during the turn. Only complete
    /// rounds are recorded: an assistant tool request always comes with all
    /// of its tool responses.
    pub messages: Vec<Message>,
    /// Text of the final answer, when the model produced one.
    pub final_text: Option<String>,
    /// Tools invoked, in call order.
    pub tools_used: Vec<String>,
    /// Code of the error that ended the turn, if any.
    pub error_code: Option<String>,
}

/// A running turn.
pub struct Turn {
    pub events: Pin<Box<dyn Stream<Item = NormalizedEvent> + Send>>,
    outcome: Arc<Mutex<TurnOutcome>>,
}

impl std::fmt::Debug for Turn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Turn")
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

impl Turn {
    /// Snapshot of the outcome so far; final once `events` is exhausted.
    #[must_use]
    pub fn outcome(&self) -> TurnOutcome {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    registry: McpRegistry,
    options: OrchestratorOptions,
    model: String,
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("model", &self.model)
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

enum Next<T> {
    Cancelled,
    Item(Option<T>),
}

impl Orchestrator {
    /// Create an orchestrator with the driver for `settings.provider`.
    pub fn new(
        settings: LlmSettings,
        registry: McpRegistry,
        options: OrchestratorOptions,
    ) -> Self {
        let model = settings.model.clone();
        let driver: Arc<dyn LlmDriver> = match settings.provider {
            ModelProvider::Gemini => Arc::new(GeminiDriver::new(settings)),
            ModelProvider::OpenRouter => Arc::new(ChatCompletionsDriver::new(settings)),
        };
        Self {
            driver,
            registry,
            options,
            model,
        }
    }

    /// Create an orchestrator around any driver.
    pub fn with_driver(
        driver: Arc<dyn LlmDriver>,
        registry: McpRegistry,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            driver,
            registry,
            options,
            model: "custom".to_string(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &McpRegistry {
        &self.registry
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one turn over `history` (system prompt and user message included).
    ///
    /// The stream always starts with `StreamStart` and ends with exactly one
    /// of `Done` or `Error`.
    #[allow(clippy::too_many_lines)]
    pub fn run_turn(&self, history: Vec<Message>, cancel: CancellationToken) -> Turn {
        let request_id = Uuid::new_v4().to_string();
        let tools = self.registry.function_declarations();
        let driver = Arc::clone(&self.driver);
        let registry = self.registry.clone();
        let opts = self.options;
        let outcome = Arc::new(Mutex::new(TurnOutcome::default()));
        let recorder = Arc::clone(&outcome);

        tracing::info!(
            request_id = %request_id,
            message_count = history.len(),
            tool_count = tools.len(),
            "Starting turn"
        );

        let events = async_stream::stream! {
            yield NormalizedEvent::StreamStart {
                request_id: request_id.clone(),
            };

            let mut history = history;
            let mut repeats: HashMap<String, usize> = HashMap::new();
            let mut iteration = 0;

            'turn: loop {
                if cancel.is_cancelled() {
                    yield fail(&recorder, &request_id, "Request cancelled", codes::CANCELLED);
                    break 'turn;
                }
                if iteration >= opts.recursion_limit {
                    tracing::error!(
                        request_id = %request_id,
                        iteration,
                        recursion_limit = opts.recursion_limit,
                        "Recursion limit reached"
                    );
                    let message = format!(
                        "Stopped after {} model rounds without a final answer",
                        opts.recursion_limit
                    );
                    yield fail(&recorder, &request_id, &message, codes::RECURSION_LIMIT);
                    break 'turn;
                }
                iteration += 1;

                tracing::info!(
                    request_id = %request_id,
                    iteration,
                    message_count = history.len(),
                    "Starting tool loop iteration"
                );

                let req = LlmRequest {
                    messages: history.clone(),
                    tools: tools.clone(),
                };

                let started = tokio::select! {
                    () = cancel.cancelled() => None,
                    res = retry_with_backoff(opts.retry, |attempt| {
                        let driver = Arc::clone(&driver);
                        let req = req.clone();
                        async move {
                            if attempt > 1 {
                                tracing::info!(attempt, "Retrying model request");
                            }
                            driver.stream(req).await
                        }
                    }) => Some(res),
                };

                let driver_stream = match started {
                    None => {
                        yield fail(&recorder, &request_id, "Request cancelled", codes::CANCELLED);
                        break 'turn;
                    }
                    Some(Err(e)) => {
                        tracing::error!(
                            request_id = %request_id,
                            iteration,
                            error = %e,
                            "Failed to start model stream"
                        );
                        let (message, code) = describe_llm_error(&e);
                        yield fail(&recorder, &request_id, &message, code);
                        break 'turn;
                    }
                    Some(Ok(s)) => s,
                };

                let bounded = timeout_stream(driver_stream, opts.request_timeout, opts.request_timeout);
                futures::pin_mut!(bounded);

                let mut round_text = String::new();
                let mut calls: BTreeMap<usize, ToolCall> = BTreeMap::new();

                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => Next::Cancelled,
                        item = bounded.next() => Next::Item(item),
                    };
                    match next {
                        Next::Cancelled => {
                            yield fail(&recorder, &request_id, "Request cancelled", codes::CANCELLED);
                            break 'turn;
                        }
                        Next::Item(None) => break,
                        Next::Item(Some(Err(timeout))) => {
                            tracing::error!(
                                request_id = %request_id,
                                iteration,
                                error = %timeout,
                                "Model stream timed out"
                            );
                            let message = format!("Model response timed out: {timeout}");
                            yield fail(&recorder, &request_id, &message, codes::REQUEST_TIMEOUT);
                            break 'turn;
                        }
                        Next::Item(Some(Ok(Err(e)))) => {
                            tracing::error!(
                                request_id = %request_id,
                                iteration,
                                error = %e,
                                "Model stream failed"
                            );
                            let (message, code) = describe_llm_error(&e);
                            yield fail(&recorder, &request_id, &message, code);
                            break 'turn;
                        }
                        Next::Item(Some(Ok(Ok(event)))) => match event {
                            NormalizedEvent::MessageDelta { text } => {
                                round_text.push_str(&text);
                                yield NormalizedEvent::MessageDelta { text };
                            }
                            NormalizedEvent::ToolCallComplete { call_index, id, name, arguments_json } => {
                                calls.insert(
                                    call_index,
                                    ToolCall::function(id.clone(), name.clone(), arguments_json.clone()),
                                );
                                yield NormalizedEvent::ToolCallComplete { call_index, id, name, arguments_json };
                            }
                            NormalizedEvent::Done | NormalizedEvent::StreamStart { .. } => {}
                            NormalizedEvent::Error { message, code } => {
                                record_error(&recorder, code.as_deref().unwrap_or(codes::LLM_ERROR));
                                yield NormalizedEvent::Error { message, code };
                                break 'turn;
                            }
                            other => yield other,
                        },
                    }
                }

                if calls.is_empty() {
                    tracing::info!(
                        request_id = %request_id,
                        iteration,
                        answer_length = round_text.len(),
                        "Turn complete"
                    );
                    {
                        let mut out = recorder.lock().unwrap_or_else(PoisonError::into_inner);
                        out.messages.push(Message::assistant(round_text.clone()));
                        out.final_text = Some(round_text);
                    }
                    yield NormalizedEvent::Done;
                    break 'turn;
                }

                let calls: Vec<ToolCall> = calls.into_values().collect();
                let mut round_messages = vec![Message::assistant_tool_calls(round_text, calls.clone())];

                for call in &calls {
                    let tool_name = call.function.name.clone();

                    let count = {
                        let key = repeat_key(&tool_name, &call.function.arguments);
                        let count = repeats.entry(key).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if count > MAX_TOOL_REPEATS {
                        tracing::warn!(
                            request_id = %request_id,
                            tool_name = %tool_name,
                            count,
                            "Same tool call repeated, stopping turn"
                        );
                        yield NormalizedEvent::LoopWarning { tool: tool_name.clone(), count };
                        let message = format!(
                            "Tool '{tool_name}' was called {count} times with the same arguments"
                        );
                        yield fail(&recorder, &request_id, &message, codes::TOOL_LOOP);
                        break 'turn;
                    }

                    tracing::info!(
                        request_id = %request_id,
                        iteration,
                        tool_id = %call.id,
                        tool_name = %tool_name,
                        "Executing tool call"
                    );
                    tracing::debug!(
                        request_id = %request_id,
                        tool_id = %call.id,
                        arguments = %call.function.arguments,
                        "Tool call arguments"
                    );

                    recorder
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .tools_used
                        .push(tool_name.clone());

                    let (content, success) = match serde_json::from_str::<serde_json::Value>(&call.function.arguments) {
                        Err(e) => (format!("ERROR: invalid JSON arguments: {e}"), false),
                        Ok(args) => {
                            let res = tokio::select! {
                                () = cancel.cancelled() => None,
                                r = registry.call_tool(&tool_name, args, opts.tool_timeout) => Some(r),
                            };
                            match res {
                                None => {
                                    yield fail(&recorder, &request_id, "Request cancelled", codes::CANCELLED);
                                    break 'turn;
                                }
                                Some(Ok(output)) => (output.text, !output.is_error),
                                Some(Err(e)) => (format!("ERROR: {e}"), false),
                            }
                        }
                    };

                    if success {
                        tracing::info!(
                            request_id = %request_id,
                            tool_id = %call.id,
                            tool_name = %tool_name,
                            result_length = content.len(),
                            "Tool call succeeded"
                        );
                    } else {
                        tracing::warn!(
                            request_id = %request_id,
                            tool_id = %call.id,
                            tool_name = %tool_name,
                            result = %content,
                            "Tool call failed"
                        );
                    }

                    yield NormalizedEvent::ToolResult {
                        id: call.id.clone(),
                        name: tool_name,
                        content: content.clone(),
                        success,
                    };
                    round_messages.push(Message::tool(call.id.clone(), content));
                }

                history.extend(round_messages.iter().cloned());
                recorder
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .messages
                    .extend(round_messages);
            }
        };

        Turn {
            events: Box::pin(events),
            outcome,
        }
    }
}

fn record_error(recorder: &Mutex<TurnOutcome>, code: &str) {
    recorder
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .error_code = Some(code.to_string());
}

fn fail(recorder: &Mutex<TurnOutcome>, request_id: &str, message: &str, code: &str) -> NormalizedEvent {
    tracing::debug!(request_id = %request_id, code, "Turn ended with error");
    record_error(recorder, code);
    NormalizedEvent::error(message, code)
}

/// Operator-facing message and code for a driver error.
fn describe_llm_error(e: &LlmError) -> (String, &'static str) {
    match e {
        LlmError::RateLimited {
            provider,
            retry_after,
            ..
        } => {
            let message = match retry_after {
                Some(d) => format!(
                    "{provider} rate limit exceeded, retry after {} seconds",
                    d.as_secs().max(1)
                ),
                None => format!("{provider} rate limit exceeded"),
            };
            (message, codes::RATE_LIMITED)
        }
        LlmError::Auth { .. } => (e.to_string(), codes::AUTH),
        LlmError::Timeout { .. } => (e.to_string(), codes::REQUEST_TIMEOUT),
        _ => (e.to_string(), codes::LLM_ERROR),
    }
}

/// Identity of a tool call for repeat detection: name plus canonical arguments.
fn repeat_key(name: &str, arguments: &str) -> String {
    let args = serde_json::from_str::<serde_json::Value>(arguments)
        .map_or_else(|_| arguments.trim().to_string(), |v| v.to_string());
    format!("{name}\u{0}{args}")
}
