use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use gemini_mcp_agent::agent::{ExportFormat, DEFAULT_THREAD_ID};
use gemini_mcp_agent::chat::{ChatRepl, Command, Flow};
use gemini_mcp_agent::llm::{EventStream, LlmDriver, LlmError, LlmRequest, MessageRole};
use gemini_mcp_agent::mcp::{McpRegistry, NativeTool};
use gemini_mcp_agent::normalized::{NormalizedEvent, codes};
use gemini_mcp_agent::{Agent, AgentConfig, AgentEvent};

type Round = Result<Vec<NormalizedEvent>, LlmError>;

/// Plays back one scripted round per model request.
struct ScriptedDriver {
    rounds: Mutex<VecDeque<Round>>,
    seen: Mutex<Vec<LlmRequest>>,
}

impl ScriptedDriver {
    fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, req: LlmRequest) -> Result<EventStream, LlmError> {
        self.seen.lock().unwrap().push(req);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![NormalizedEvent::Done]))?;
        Ok(Box::pin(futures::stream::iter(round.into_iter().map(Ok))))
    }
}

/// Streams a few tokens slowly, then asks for the `stall` tool.
struct TricklingDriver;

#[async_trait]
impl LlmDriver for TricklingDriver {
    async fn stream(&self, _req: LlmRequest) -> Result<EventStream, LlmError> {
        Ok(Box::pin(async_stream::stream! {
            for token in ["still", " thinking", "..."] {
                tokio::time::sleep(Duration::from_secs(3)).await;
                yield Ok(text(token));
            }
            yield Ok(call("c1", "stall", "{}"));
            yield Ok(NormalizedEvent::Done);
        }))
    }
}

#[derive(Debug)]
struct Stall;

#[async_trait]
impl NativeTool for Stall {
    fn name(&self) -> &str {
        "stall"
    }
    fn description(&self) -> &str {
        "Takes an hour"
    }
    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn call(&self, _args: Value) -> anyhow::Result<Value> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

fn text(s: &str) -> NormalizedEvent {
    NormalizedEvent::MessageDelta { text: s.to_string() }
}

fn call(id: &str, name: &str, args: &str) -> NormalizedEvent {
    NormalizedEvent::ToolCallComplete {
        call_index: 0,
        id: id.to_string(),
        name: name.to_string(),
        arguments_json: args.to_string(),
    }
}

fn config(dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.filesystem_path = dir.to_path_buf();
    config.files.prompt_file = dir.join("no_prompt.md");
    config.files.mcp_config_file = dir.join("mcp.json");
    config
}

async fn agent(dir: &Path, rounds: Vec<Round>) -> (Agent, Arc<ScriptedDriver>) {
    let driver = ScriptedDriver::new(rounds);
    let agent = Agent::with_driver(config(dir), Arc::clone(&driver) as Arc<dyn LlmDriver>, McpRegistry::new_empty())
        .await
        .unwrap();
    (agent, driver)
}

async fn run(agent: &Agent, input: &str) -> Vec<AgentEvent> {
    agent
        .process_message(input, DEFAULT_THREAD_ID, CancellationToken::new())
        .collect()
        .await
}

#[tokio::test]
async fn test_plain_answer_streams_text_then_done() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, driver) = agent(
        dir.path(),
        vec![Ok(vec![text("Hello"), text(" there"), NormalizedEvent::Done])],
    )
    .await;

    let events = run(&agent, "hi").await;
    assert!(matches!(&events[0], AgentEvent::Text(t) if t == "Hello"));
    assert!(matches!(&events[1], AgentEvent::Text(t) if t == " there"));
    assert!(matches!(&events[2], AgentEvent::Done { tools_used, .. } if tools_used.is_empty()));

    let requests = driver.requests();
    let messages = &requests[0].messages;
    assert_eq!(messages[0].role, MessageRole::System);
    assert!(messages[1].content.contains("USER REQUEST: hi"));
    assert!(messages[1].content.contains("Working directory:"));
    assert!(requests[0].tools.iter().any(|t| t.name == "safe_delete_file"));

    let status = agent.status();
    assert_eq!(status.context_items, 1);
    assert_eq!(status.last_action.as_deref(), Some("conversation"));
}

#[tokio::test]
async fn test_tool_call_deletes_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.txt"), "bye").unwrap();
    let (agent, _) = agent(
        dir.path(),
        vec![
            Ok(vec![
                call("c1", "safe_delete_file", r#"{"file_path":"old.txt"}"#),
                NormalizedEvent::Done,
            ]),
            Ok(vec![text("Deleted old.txt"), NormalizedEvent::Done]),
        ],
    )
    .await;

    let events = run(&agent, "delete old.txt").await;
    assert!(!dir.path().join("old.txt").exists());

    let result = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolResult { content, success, .. } => Some((content.clone(), *success)),
            _ => None,
        })
        .unwrap();
    assert!(result.1);
    assert!(result.0.contains("SUCCESS"));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Done { tools_used, .. }) if tools_used == &["safe_delete_file".to_string()]
    ));
    assert_eq!(agent.status().last_action.as_deref(), Some("delete_file"));
}

#[tokio::test]
async fn test_memory_is_per_thread_and_clearable() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, driver) = agent(
        dir.path(),
        vec![
            Ok(vec![text("first"), NormalizedEvent::Done]),
            Ok(vec![text("second"), NormalizedEvent::Done]),
            Ok(vec![text("other"), NormalizedEvent::Done]),
        ],
    )
    .await;

    run(&agent, "one").await;
    run(&agent, "two").await;
    agent
        .process_message("three", "side", CancellationToken::new())
        .collect::<Vec<_>>()
        .await;

    assert_eq!(agent.thread_len(DEFAULT_THREAD_ID), 2);
    assert_eq!(agent.thread_len("side"), 1);

    let requests = driver.requests();
    let second = &requests[1].messages;
    assert!(second.iter().any(|m| m.role == MessageRole::Assistant && m.content == "first"));
    let side = &requests[2].messages;
    assert!(!side.iter().any(|m| m.content == "first"));

    agent.clear_memory();
    assert_eq!(agent.thread_len(DEFAULT_THREAD_ID), 0);
    assert_eq!(agent.status().context_items, 0);
}

#[tokio::test]
async fn test_rate_limit_gives_friendly_error() {
    let dir = tempfile::tempdir().unwrap();
    let limited = || {
        Err(LlmError::RateLimited {
            provider: "Google Gemini",
            retry_after: Some(Duration::from_millis(1)),
            body: "quota exhausted".to_string(),
        })
    };
    let (agent, _) = agent(dir.path(), vec![limited(), limited(), limited()]).await;

    let events = run(&agent, "hi").await;
    match events.last() {
        Some(AgentEvent::Error { message, code }) => {
            assert_eq!(code.as_deref(), Some(codes::RATE_LIMITED));
            assert!(message.contains("API rate limit exceeded (error 429)"));
        }
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(agent.thread_len(DEFAULT_THREAD_ID), 0);

    let insights = agent.insights();
    assert!(insights.context.is_some());
}

#[tokio::test]
async fn test_cancelled_turn_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _) = agent(dir.path(), vec![Ok(vec![text("never"), NormalizedEvent::Done])]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let events: Vec<AgentEvent> = agent
        .process_message("hi", DEFAULT_THREAD_ID, cancel)
        .collect()
        .await;

    assert!(matches!(
        events.last(),
        Some(AgentEvent::Error { code, .. }) if code.as_deref() == Some(codes::CANCELLED)
    ));
}

#[tokio::test]
async fn test_context_export_and_chat_commands() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _) = agent(dir.path(), vec![Ok(vec![text("ok"), NormalizedEvent::Done])]).await;
    run(&agent, "hello").await;

    let json: serde_json::Value =
        serde_json::from_str(&agent.export_context(ExportFormat::Json).unwrap()).unwrap();
    assert_eq!(json["context_history"].as_array().map(Vec::len), Some(1));
    let md = agent.export_context(ExportFormat::Markdown).unwrap();
    assert!(md.starts_with("# Agent Context"));

    let out = tempfile::tempdir().unwrap();
    let mut repl = ChatRepl::new(agent.clone()).with_export_dir(out.path());
    assert!(repl.export_history().await.unwrap().is_none());

    let path = repl.export_context(ExportFormat::Markdown).await.unwrap();
    assert!(path.starts_with(out.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("md"));

    assert_eq!(repl.handle_command(Command::Memory).await, Flow::Continue);
    assert_eq!(agent.status().context_items, 0);
    assert_eq!(repl.handle_command(Command::Quit).await, Flow::Quit);

    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_turn_past_ceiling_reports_request_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.agent.request_timeout = 10.0;
    config.agent.tool_timeout = 3600.0;
    config.agent.recursion_limit = 2;
    let registry = McpRegistry::new_empty().with_native_tool(Arc::new(Stall));
    let agent = Agent::with_driver(config, Arc::new(TricklingDriver), registry)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let events = run(&agent, "think hard").await;
    let elapsed = started.elapsed();

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "still thinking...");
    assert!(
        events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCall { name, .. } if name == "stall"))
    );

    match events.last() {
        Some(AgentEvent::Error { message, code }) => {
            assert_eq!(code.as_deref(), Some(codes::REQUEST_TIMEOUT));
            assert!(message.contains("timed out after 20 seconds"), "{message}");
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_secs(20));
    assert!(elapsed < Duration::from_secs(60));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_tree_command_lists_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/a.txt"), "abc").unwrap();
    std::fs::write(dir.path().join(".hidden"), "x").unwrap();
    let (agent, _) = agent(dir.path(), vec![]).await;
    let mut repl = ChatRepl::new(agent.clone());

    let tree = repl.file_tree(".").await.unwrap();
    assert!(tree.contains("└── 📁 sub/"));
    assert!(tree.contains("📄 a.txt (3.0 B)"));
    assert!(!tree.contains(".hidden"));

    assert!(repl.file_tree("..").await.is_err());
    assert!(repl.file_tree("missing").await.is_err());
    for path in ["sub", ".."] {
        let flow = repl.handle_command(Command::Tree(path.to_string())).await;
        assert_eq!(flow, Flow::Continue);
    }

    agent.shutdown().await;
}
