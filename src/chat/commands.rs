//! Slash command parsing.

use crate::agent::ExportFormat;

/// Entries shown by `/history` without an argument.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Clear,
    Status,
    History(usize),
    Tools,
    Export,
    Reload,
    Memory,
    Insights,
    ExportContext(ExportFormat),
    /// Directory to list, relative to the working directory.
    Tree(String),
    /// A known command with a bad argument.
    Invalid(String),
    Unknown(String),
}

/// Parse a line starting with `/`. Returns `None` for ordinary messages.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }

    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let name = name.to_lowercase();
    let rest = rest.trim();
    let arg = rest.split_whitespace().next();

    let cmd = match name.as_str() {
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        "/clear" => Command::Clear,
        "/status" => Command::Status,
        "/history" => Command::History(
            arg.and_then(|a| a.parse::<usize>().ok())
                .unwrap_or(DEFAULT_HISTORY_LIMIT),
        ),
        "/tools" => Command::Tools,
        "/export" => Command::Export,
        "/reload" => Command::Reload,
        "/memory" => Command::Memory,
        "/insights" => Command::Insights,
        "/tree" => Command::Tree(if rest.is_empty() { ".".to_string() } else { rest.to_string() }),
        "/export_context" => match arg.map_or(Ok(ExportFormat::Json), |a| a.parse::<ExportFormat>()) {
            Ok(format) => Command::ExportContext(format),
            Err(e) => Command::Invalid(e),
        },
        _ => Command::Unknown(name),
    };
    Some(cmd)
}

pub const HELP_TEXT: &str = "\
Available commands:
  /help                             Show this help
  /quit, /exit                      Leave the chat
  /clear                            Clear the screen
  /status                           Show agent status
  /history [n]                      Show the last n history entries (default 10)
  /tools                            List available tools by category
  /export                           Export chat history to Markdown
  /reload                           Reload the system prompt from file
  /memory                           Clear the agent's context memory
  /insights                         Show performance analytics
  /export_context [json|markdown]   Export agent context and statistics
  /tree [path]                      Show the file tree (default: working directory)

Press Ctrl+C during a response to cancel it.";
