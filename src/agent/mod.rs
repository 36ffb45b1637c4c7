//! The agent: one configured model, its tools and conversation memory.
//!
//! [`Agent::initialize`] wires everything together:
//! 1. Validate configuration and resolve model credentials
//! 2. Load `mcp.json` and connect the enabled servers
//! 3. Add the local delete tools and categorise every tool
//! 4. Render the system prompt
//!
//! [`Agent::process_message`] then runs one user turn through the
//! orchestrator and streams [`AgentEvent`]s back to the caller.

pub mod context;
pub mod prompt;
pub mod recovery;

pub use context::{ContextEntry, ContextInsights, ContextKind, ContextManager, ExportFormat};
pub use prompt::{PromptManager, available_prompts};
pub use recovery::{ErrorKind, ErrorRecovery, RecoveryAction, RecoveryStats};

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ConfigError, ModelProvider};
use crate::llm::{LlmDriver, LlmSettings, Message, Orchestrator, OrchestratorOptions};
use crate::mcp::{ConnectOptions, McpConfig, McpConfigError, McpRegistry};
use crate::normalized::{NormalizedEvent, codes};
use crate::resilience::{Watchdog, extract_retry_delay};
use crate::session::SessionStore;
use crate::tools::{ToolAnalyzer, ToolCategory, local_tools};

/// Thread used when the caller does not pick one.
pub const DEFAULT_THREAD_ID: &str = "default";

/// Recovery suggestions shown with an error.
const MAX_RECOVERY_SUGGESTIONS: usize = 3;

/// Intent recorded for turns that used no tool.
const CONVERSATION_INTENT: &str = "conversation";

const GEMINI_RATE_LIMIT_DOCS: &str = "https://ai.google.dev/gemini-api/docs/rate-limits";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid MCP configuration: {0}")]
    McpConfig(#[from] McpConfigError),

    #[error("MCP initialisation failed: {0}")]
    Mcp(String),

    #[error("working directory {path} is not usable: {source}")]
    WorkingDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to export context: {0}")]
    Export(#[from] serde_json::Error),
}

/// What a caller sees while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        success: bool,
    },
    LoopWarning {
        tool: String,
        count: usize,
    },
    Error {
        message: String,
        code: Option<String>,
    },
    Done {
        tools_used: Vec<String>,
        elapsed: Duration,
    },
}

pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub model_name: String,
    pub provider: &'static str,
    pub temperature: f32,
    pub use_memory: bool,
    pub working_directory: String,
    pub prompt_file: String,
    pub servers: Vec<String>,
    pub total_tools: usize,
    pub tools_by_category: BTreeMap<String, usize>,
    pub context_items: usize,
    pub last_action: Option<String>,
    pub threads: usize,
    pub active_operations: usize,
    pub error_stats: RecoveryStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInsights {
    pub context: Option<ContextInsights>,
    pub errors: RecoveryStats,
}

struct AgentInner {
    config: AgentConfig,
    orchestrator: Orchestrator,
    analyzer: ToolAnalyzer,
    prompts: tokio::sync::Mutex<PromptManager>,
    system_prompt: RwLock<String>,
    sessions: SessionStore,
    context: Mutex<ContextManager>,
    recovery: Mutex<ErrorRecovery>,
    watchdog: Watchdog,
}

/// A ready-to-use agent. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.inner.config.agent.model_name)
            .field("orchestrator", &self.inner.orchestrator)
            .finish_non_exhaustive()
    }
}

/// Marks a watched turn finished even if the stream is dropped early.
struct WatchGuard {
    watchdog: Watchdog,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.watchdog.complete(self.id);
    }
}

impl Agent {
    /// Connect tools and build the agent from `config`.
    pub async fn initialize(config: AgentConfig) -> Result<Self, AgentError> {
        tracing::info!(
            provider = config.agent.model_provider.as_str(),
            model = %config.agent.model_name,
            working_dir = %config.filesystem_path.display(),
            "Initialising agent"
        );

        config.validate()?;
        let settings = LlmSettings::from_config(&config)?;

        let mcp = McpConfig::load(
            &config.files.mcp_config_file,
            &config.filesystem_path_display(),
        )?;
        let registry = McpRegistry::connect(
            &mcp,
            ConnectOptions {
                connect_timeout: config.request_timeout(),
            },
        )
        .await
        .map_err(|e| AgentError::Mcp(format!("{e:#}")))?;

        let options = OrchestratorOptions::from_config(&config);
        let registry = with_local_tools(&config, registry)?;
        let orchestrator = Orchestrator::new(settings, registry, options);
        let agent = Self::assemble(config, orchestrator).await;

        tracing::info!(
            tools = agent.inner.analyzer.total(),
            servers = ?agent.inner.orchestrator.registry().server_names(),
            "Agent initialised"
        );
        Ok(agent)
    }

    /// Build an agent around a custom model driver and a prepared registry.
    /// The local tools are added here.
    pub async fn with_driver(
        config: AgentConfig,
        driver: Arc<dyn LlmDriver>,
        registry: McpRegistry,
    ) -> Result<Self, AgentError> {
        let options = OrchestratorOptions::from_config(&config);
        let registry = with_local_tools(&config, registry)?;
        let orchestrator = Orchestrator::with_driver(driver, registry, options);
        Ok(Self::assemble(config, orchestrator).await)
    }

    async fn assemble(config: AgentConfig, orchestrator: Orchestrator) -> Self {
        let analyzer = ToolAnalyzer::analyze(orchestrator.registry().tools());

        let mut prompts = PromptManager::new(
            config.files.prompt_file.clone(),
            config.filesystem_path_display(),
        );
        prompts.set_tools_description(analyzer.describe_tools());
        let system_prompt = prompts.system_prompt().await;

        let max_entries = config.agent.max_context_files.saturating_mul(2);

        Self {
            inner: Arc::new(AgentInner {
                orchestrator,
                analyzer,
                prompts: tokio::sync::Mutex::new(prompts),
                system_prompt: RwLock::new(system_prompt),
                sessions: SessionStore::new(),
                context: Mutex::new(ContextManager::new(max_entries)),
                recovery: Mutex::new(ErrorRecovery::new()),
                watchdog: Watchdog::start(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn system_prompt(&self) -> String {
        self.inner
            .system_prompt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wrap the user's text with the working-directory context.
    fn enhanced_input(&self, user_input: &str) -> String {
        format!(
            "Working directory: '{}'\n\n\
             TASK: Carry out the user's request, choosing suitable tools on your own.\n\n\
             USER REQUEST: {user_input}",
            self.inner.config.filesystem_path_display()
        )
    }

    /// Run one user turn. The stream ends after `Done` or `Error`.
    #[allow(clippy::too_many_lines)]
    pub fn process_message(
        &self,
        user_input: &str,
        thread_id: &str,
        cancel: CancellationToken,
    ) -> AgentStream {
        let agent = self.clone();
        let inner = Arc::clone(&self.inner);
        let user_input = user_input.to_string();
        let thread_id = thread_id.to_string();

        let stream = async_stream::stream! {
            let started = Instant::now();
            let user_message = Message::user(agent.enhanced_input(&user_input));

            let session = inner
                .config
                .agent
                .use_memory
                .then(|| inner.sessions.get_or_create(&thread_id));
            let history = match &session {
                Some(session) => {
                    session.set_system_prompt(agent.system_prompt());
                    let mut history = session.messages_with_system();
                    history.push(user_message.clone());
                    history
                }
                None => vec![Message::system(agent.system_prompt()), user_message.clone()],
            };

            let turn_token = cancel.child_token();
            let limit = u32::try_from(inner.config.agent.recursion_limit).unwrap_or(u32::MAX);
            let turn_timeout = inner.config.request_timeout().saturating_mul(limit.max(1));
            let _guard = WatchGuard {
                watchdog: inner.watchdog.clone(),
                id: inner.watchdog.register("chat_turn", turn_timeout, turn_token.clone()),
            };

            tracing::info!(
                thread_id = %thread_id,
                history_len = history.len(),
                "Processing message"
            );

            let mut turn = inner.orchestrator.run_turn(history, turn_token.clone());
            let mut failure: Option<(String, Option<String>)> = None;

            while let Some(event) = turn.events.next().await {
                match event {
                    NormalizedEvent::MessageDelta { text } => yield AgentEvent::Text(text),
                    NormalizedEvent::ToolCallComplete { id, name, arguments_json, .. } => {
                        yield AgentEvent::ToolCall { id, name, arguments: arguments_json };
                    }
                    NormalizedEvent::ToolResult { id, name, content, success } => {
                        yield AgentEvent::ToolResult { id, name, content, success };
                    }
                    NormalizedEvent::LoopWarning { tool, count } => {
                        yield AgentEvent::LoopWarning { tool, count };
                    }
                    NormalizedEvent::Error { message, code } => {
                        failure = Some((message, code));
                        break;
                    }
                    NormalizedEvent::Done => break,
                    NormalizedEvent::StreamStart { .. } | NormalizedEvent::ToolCallDelta { .. } => {}
                }
            }

            let outcome = turn.outcome();
            let elapsed = started.elapsed();

            if let Some(session) = &session {
                if !outcome.messages.is_empty() {
                    let mut messages = Vec::with_capacity(outcome.messages.len() + 1);
                    messages.push(user_message);
                    messages.extend(outcome.messages.iter().cloned());
                    session.extend(messages);
                }
            }

            let intent = outcome
                .tools_used
                .first()
                .and_then(|t| inner.analyzer.category_of(t))
                .map_or(CONVERSATION_INTENT, ToolCategory::as_str);
            let kind = match outcome.tools_used.first().and_then(|t| inner.analyzer.category_of(t)) {
                None => ContextKind::UserAction,
                Some(ToolCategory::WebSearch | ToolCategory::FetchUrl | ToolCategory::Other) => {
                    ContextKind::ToolUsage
                }
                Some(_) => ContextKind::FileOperation,
            };
            let mut entry = ContextEntry::new(kind, intent, json!({ "raw_input": user_input }))
                .with_tool(outcome.tools_used.last().cloned())
                .with_execution_time(elapsed.as_secs_f64());
            if let Some((message, _)) = &failure {
                entry = entry.failed(message.clone());
            }
            inner
                .context
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add(entry);

            match failure {
                None => {
                    tracing::info!(
                        thread_id = %thread_id,
                        tools_used = outcome.tools_used.len(),
                        elapsed_ms = elapsed.as_millis(),
                        "Message processed"
                    );
                    yield AgentEvent::Done { tools_used: outcome.tools_used, elapsed };
                }
                Some((message, code)) => {
                    let watchdog_fired = turn_token.is_cancelled() && !cancel.is_cancelled();
                    let (message, code) = if watchdog_fired {
                        (
                            format!("Operation timed out after {} seconds", turn_timeout.as_secs()),
                            Some(codes::REQUEST_TIMEOUT.to_string()),
                        )
                    } else {
                        (message, code)
                    };
                    tracing::error!(
                        thread_id = %thread_id,
                        code = code.as_deref().unwrap_or("-"),
                        error = %message,
                        "Message processing failed"
                    );
                    let rendered = agent.render_error(&message, code.as_deref(), intent);
                    yield AgentEvent::Error { message: rendered, code };
                }
            }
        };

        Box::pin(stream)
    }

    /// Operator-facing text for a failed turn.
    fn render_error(&self, message: &str, code: Option<&str>, intent: &str) -> String {
        match code {
            Some(codes::RATE_LIMITED) => {
                rate_limit_message(self.inner.config.agent.model_provider, message)
            }
            Some(codes::CANCELLED) => message.to_string(),
            _ => {
                let (kind, actions) = self
                    .inner
                    .recovery
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .analyze(message, Some(intent));
                tracing::debug!(kind = %kind, suggestions = actions.len(), "Recovery suggestions");
                format_enhanced_error(message, &actions)
            }
        }
    }

    pub fn status(&self) -> AgentStatus {
        let cfg = &self.inner.config;
        let (context_items, last_action) = {
            let ctx = self
                .inner
                .context
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (ctx.len(), ctx.last().map(|e| e.intent.clone()))
        };

        AgentStatus {
            model_name: cfg.agent.model_name.clone(),
            provider: cfg.agent.model_provider.display_name(),
            temperature: cfg.agent.temperature,
            use_memory: cfg.agent.use_memory,
            working_directory: cfg.filesystem_path_display(),
            prompt_file: cfg.files.prompt_file.display().to_string(),
            servers: self.inner.orchestrator.registry().server_names(),
            total_tools: self.inner.analyzer.total(),
            tools_by_category: self
                .inner
                .analyzer
                .summary()
                .into_iter()
                .map(|(c, names)| (c.as_str().to_string(), names.len()))
                .collect(),
            context_items,
            last_action,
            threads: self.inner.sessions.len(),
            active_operations: self.inner.watchdog.active().len(),
            error_stats: self.error_stats(),
        }
    }

    fn error_stats(&self) -> RecoveryStats {
        self.inner
            .recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    pub fn insights(&self) -> AgentInsights {
        let context = self
            .inner
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insights();
        AgentInsights {
            context,
            errors: self.error_stats(),
        }
    }

    pub fn export_context(&self, format: ExportFormat) -> Result<String, AgentError> {
        Ok(self
            .inner
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .export(format)?)
    }

    /// Forget the context log and every conversation thread. Statistics stay.
    pub fn clear_memory(&self) {
        self.inner
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear(true);
        self.inner.sessions.clear();
        tracing::info!("Context memory cleared");
    }

    /// Exchanges stored for `thread_id`.
    pub fn thread_len(&self, thread_id: &str) -> usize {
        self.inner
            .sessions
            .get(thread_id)
            .map_or(0, |s| s.exchange_count())
    }

    /// Re-read the prompt file; returns the new system prompt.
    pub async fn reload_prompt(&self) -> String {
        let prompt = self.inner.prompts.lock().await.reload().await;
        *self
            .inner
            .system_prompt
            .write()
            .unwrap_or_else(PoisonError::into_inner) = prompt.clone();
        prompt
    }

    /// Switch to another prompt file and reload. `false` if it does not exist.
    pub async fn switch_prompt(&self, path: impl Into<std::path::PathBuf>) -> bool {
        let switched = self.inner.prompts.lock().await.switch(path).await;
        if switched {
            self.reload_prompt().await;
        }
        switched
    }

    pub fn tools_by_category(&self) -> Vec<(ToolCategory, Vec<String>)> {
        self.inner.analyzer.summary()
    }

    pub fn tools_description(&self) -> String {
        self.inner.analyzer.describe_tools()
    }

    /// Stop the watchdog and close every MCP connection.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down agent");
        self.inner.watchdog.stop().await;
        self.inner.orchestrator.registry().shutdown().await;
    }
}

fn with_local_tools(config: &AgentConfig, registry: McpRegistry) -> Result<McpRegistry, AgentError> {
    let tools = local_tools(&config.filesystem_path).map_err(|source| {
        AgentError::WorkingDirectory {
            path: config.filesystem_path.display().to_string(),
            source,
        }
    })?;
    Ok(tools.into_iter().fold(registry, |registry, tool| {
        tracing::info!(tool = tool.name(), "Added local tool");
        registry.with_native_tool(tool)
    }))
}

/// Friendly provider-specific rate limit message with a wait hint.
pub fn rate_limit_message(provider: ModelProvider, error: &str) -> String {
    let wait_hint = match extract_retry_delay(error) {
        Some(d) => format!(
            "Please wait about {} seconds and try again.",
            d.as_secs().max(1)
        ),
        None => "Please wait a little and try again.".to_string(),
    };
    match provider {
        ModelProvider::Gemini => format!(
            "{} API rate limit exceeded (error 429)\n\n{wait_hint}\n\nQuota details: {GEMINI_RATE_LIMIT_DOCS}",
            provider.display_name()
        ),
        ModelProvider::OpenRouter => format!(
            "{} API rate limit exceeded (error 429)\n\n{wait_hint}",
            provider.display_name()
        ),
    }
}

/// Error text followed by up to three recovery suggestions.
pub fn format_enhanced_error(message: &str, actions: &[RecoveryAction]) -> String {
    let mut out = format!("Error: {message}\n\n");
    if actions.is_empty() {
        out.push_str("Try rephrasing the request or ask for help.");
        return out;
    }
    out.push_str("Suggestions:\n");
    for (i, action) in actions.iter().take(MAX_RECOVERY_SUGGESTIONS).enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, action.description));
    }
    out.push_str("\nTry rephrasing the request or adding more detail.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_message() {
        let gemini = rate_limit_message(
            ModelProvider::Gemini,
            "Google Gemini rate limit exceeded, retry after 30 seconds",
        );
        assert!(gemini.starts_with("Google Gemini API rate limit exceeded (error 429)"));
        assert!(gemini.contains("about 30 seconds"));
        assert!(gemini.contains(GEMINI_RATE_LIMIT_DOCS));

        let openrouter = rate_limit_message(ModelProvider::OpenRouter, "OpenRouter rate limit exceeded");
        assert!(openrouter.starts_with("OpenRouter API rate limit exceeded"));
        assert!(openrouter.contains("wait a little"));
        assert!(!openrouter.contains("ai.google.dev"));
    }

    #[test]
    fn test_enhanced_error_lists_three_suggestions() {
        let mut recovery = ErrorRecovery::new();
        let (_, actions) = recovery.analyze("file not found: 'a.txt'", None);
        let text = format_enhanced_error("file not found: 'a.txt'", &actions);
        assert!(text.starts_with("Error: file not found"));
        assert!(text.contains("1. Look for files similar to 'a.txt'"));
        assert!(text.contains("3. List the contents"));
        assert!(!text.contains("4."));

        let bare = format_enhanced_error("x", &[]);
        assert!(bare.ends_with("ask for help."));
    }
}
