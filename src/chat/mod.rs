//! Interactive terminal chat.
//!
//! Reads lines from stdin, runs slash commands locally and sends everything
//! else to the [`Agent`]. Ctrl+C while a response streams cancels only that
//! turn; Ctrl+C or EOF at the prompt ends the session.

pub mod commands;
pub mod history;
pub mod render;
pub mod tree;

pub use commands::{Command, HELP_TEXT};
pub use history::{ChatHistory, EntryKind};

use std::io::Write as _;
use std::path::PathBuf;

use chrono::Local;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentEvent, DEFAULT_THREAD_ID};
use crate::normalized::codes;

const TOOL_ARGS_PREVIEW: usize = 200;
const TOOL_RESULT_PREVIEW: usize = 300;
const TASK_DONE_NOTICE: &str = "✅ Task completed successfully.";

/// Whether the REPL keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

enum Input {
    Line(Option<String>),
    Interrupted,
    Failed(std::io::Error),
}

#[derive(Debug)]
pub struct ChatRepl {
    agent: Agent,
    history: ChatHistory,
    thread_id: String,
    export_dir: PathBuf,
}

fn flush() {
    let _ = std::io::stdout().flush();
}

impl ChatRepl {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            history: ChatHistory::new(),
            thread_id: DEFAULT_THREAD_ID.to_string(),
            export_dir: PathBuf::from("."),
        }
    }

    /// Directory receiving `/export` and `/export_context` files.
    #[must_use]
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    fn print_header(&self) {
        println!("Gemini MCP Agent");
        println!("{}", render::status_bar(&self.agent.status()));
        println!("Type /help for available commands, /quit to exit");
        println!();
    }

    /// Run until `/quit`, Ctrl+C at the prompt, or end of input. Shuts the
    /// agent down on the way out.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.print_header();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("> ");
            flush();

            let input = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(line) => Input::Line(line),
                    Err(e) => Input::Failed(e),
                },
                _ = tokio::signal::ctrl_c() => Input::Interrupted,
            };

            let line = match input {
                Input::Line(Some(line)) => line,
                Input::Line(None) | Input::Interrupted => {
                    println!();
                    break;
                }
                Input::Failed(e) => {
                    tracing::error!(error = %e, "Failed to read input");
                    break;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.history.push(EntryKind::User, line);

            if let Some(cmd) = commands::parse(line) {
                if self.handle_command(cmd).await == Flow::Quit {
                    break;
                }
                continue;
            }

            self.send(line).await;
            println!();
        }

        println!("Goodbye!");
        self.agent.shutdown().await;
        Ok(())
    }

    /// Stream one message through the agent, printing as it goes.
    pub async fn send(&mut self, message: &str) {
        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let mut events = self.agent.process_message(message, &self.thread_id, cancel);
        let mut text = String::new();
        let mut mid_line = false;

        while let Some(event) = events.next().await {
            match event {
                AgentEvent::Text(delta) => {
                    print!("{delta}");
                    flush();
                    mid_line = !delta.ends_with('\n');
                    text.push_str(&delta);
                }
                AgentEvent::ToolCall { name, arguments, .. } => {
                    if mid_line {
                        println!();
                        mid_line = false;
                    }
                    println!("🔧 {name} {}", render::truncate(&arguments, TOOL_ARGS_PREVIEW));
                }
                AgentEvent::ToolResult { name, content, success, .. } => {
                    let mark = if success { "✓" } else { "✗" };
                    let preview = render::truncate(content.trim(), TOOL_RESULT_PREVIEW);
                    println!("   {mark} {name}: {}", preview.replace('\n', "\n     "));
                }
                AgentEvent::LoopWarning { tool, count } => {
                    println!("⚠️ Tool '{tool}' keeps being called with the same arguments ({count} times)");
                }
                AgentEvent::Error { message, code } => {
                    if mid_line {
                        println!();
                    }
                    if code.as_deref() == Some(codes::CANCELLED) {
                        println!("⏹ Request cancelled");
                    } else {
                        println!("❌ {message}");
                    }
                    self.history.push(EntryKind::Error, message);
                }
                AgentEvent::Done { tools_used, elapsed } => {
                    if mid_line {
                        println!();
                    }
                    let answer = text.trim();
                    if !answer.is_empty() {
                        self.history.push(EntryKind::Agent, answer);
                    } else if !tools_used.is_empty() {
                        println!("{TASK_DONE_NOTICE}");
                        self.history.push(EntryKind::Agent, TASK_DONE_NOTICE);
                    } else {
                        println!("⚠️ Agent finished without a final response.");
                    }
                    println!("({})", render::format_elapsed(elapsed));
                }
            }
        }

        interrupt.abort();
    }

    /// Run a slash command.
    pub async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Quit => return Flow::Quit,
            Command::Help => println!("{HELP_TEXT}"),
            Command::Clear => {
                print!("\x1b[2J\x1b[H");
                flush();
                self.print_header();
            }
            Command::Status => println!("{}", render::render_status(&self.agent.status())),
            Command::History(n) => {
                for entry in self.history.recent(n) {
                    println!(
                        "[{}] {}: {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.kind.title(),
                        render::truncate(&entry.content, TOOL_RESULT_PREVIEW)
                    );
                }
            }
            Command::Tools => println!("{}", render::render_tools(&self.agent.tools_by_category())),
            Command::Export => match self.export_history().await {
                Ok(Some(path)) => println!("History exported to {}", path.display()),
                Ok(None) => println!("History is empty"),
                Err(e) => println!("❌ Export failed: {e}"),
            },
            Command::Reload => {
                self.agent.reload_prompt().await;
                println!("Prompt reloaded");
            }
            Command::Memory => {
                self.agent.clear_memory();
                println!("Context memory cleared");
            }
            Command::Insights => println!("{}", render::render_insights(&self.agent.insights())),
            Command::ExportContext(format) => {
                match self.export_context(format).await {
                    Ok(path) => println!("Context exported to {}", path.display()),
                    Err(e) => println!("❌ Failed to export context: {e:#}"),
                }
            }
            Command::Tree(path) => match self.file_tree(&path).await {
                Ok(tree) => println!("{tree}"),
                Err(e) => println!("❌ Cannot display tree for '{path}': {e:#}"),
            },
            Command::Invalid(message) => println!("❌ {message}"),
            Command::Unknown(name) => {
                println!("❌ Unknown command: {name}");
                println!("{HELP_TEXT}");
            }
        }
        Flow::Continue
    }

    /// Render `/tree` for `path` inside the agent's working directory.
    pub async fn file_tree(&self, path: &str) -> anyhow::Result<String> {
        let root = self.agent.config().filesystem_path.clone();
        let path = path.to_string();
        let tree = tokio::task::spawn_blocking(move || {
            tree::render_tree(&root, &path, tree::MAX_TREE_DEPTH)
        })
        .await??;
        Ok(tree)
    }

    /// Write the transcript to `chat_history_<timestamp>.md`. `None` when
    /// there is nothing to export.
    pub async fn export_history(&self) -> std::io::Result<Option<PathBuf>> {
        if self.history.is_empty() {
            return Ok(None);
        }
        let now = Local::now();
        let path = self
            .export_dir
            .join(format!("chat_history_{}.md", now.format("%Y%m%d_%H%M%S")));
        tokio::fs::write(&path, self.history.to_markdown(now)).await?;
        tracing::info!(path = %path.display(), "Exported chat history");
        Ok(Some(path))
    }

    /// Write the agent context to `agent_context_<timestamp>.<ext>`.
    pub async fn export_context(&self, format: crate::agent::ExportFormat) -> anyhow::Result<PathBuf> {
        let body = self.agent.export_context(format)?;
        let path = self.export_dir.join(format!(
            "agent_context_{}.{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            format.extension()
        ));
        tokio::fs::write(&path, body).await?;
        tracing::info!(path = %path.display(), "Exported agent context");
        Ok(path)
    }
}
