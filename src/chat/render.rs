//! Plain-text rendering of agent state for the terminal.

use std::fmt::Write as _;
use std::time::Duration;

use crate::agent::{AgentInsights, AgentStatus};
use crate::tools::ToolCategory;

/// Cut `text` to `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

pub fn status_bar(status: &AgentStatus) -> String {
    format!(
        "{} | {} | {} tools | memory {} | {}",
        status.provider,
        status.model_name,
        status.total_tools,
        if status.use_memory { "on" } else { "off" },
        status.working_directory
    )
}

pub fn render_status(status: &AgentStatus) -> String {
    let mut out = String::from("Agent status\n");
    let _ = writeln!(out, "  Provider:          {}", status.provider);
    let _ = writeln!(out, "  Model:             {}", status.model_name);
    let _ = writeln!(out, "  Temperature:       {}", status.temperature);
    let _ = writeln!(out, "  Memory:            {}", if status.use_memory { "enabled" } else { "disabled" });
    let _ = writeln!(out, "  Working directory: {}", status.working_directory);
    let _ = writeln!(out, "  Prompt file:       {}", status.prompt_file);
    let _ = writeln!(
        out,
        "  MCP servers:       {}",
        if status.servers.is_empty() { "-".to_string() } else { status.servers.join(", ") }
    );
    let _ = writeln!(out, "  Tools:             {}", status.total_tools);
    for (category, count) in &status.tools_by_category {
        let _ = writeln!(out, "    {category}: {count}");
    }
    let _ = writeln!(out, "  Context entries:   {}", status.context_items);
    let _ = writeln!(
        out,
        "  Last action:       {}",
        status.last_action.as_deref().unwrap_or("-")
    );
    let _ = writeln!(out, "  Threads:           {}", status.threads);
    let _ = writeln!(out, "  Active operations: {}", status.active_operations);
    let _ = write!(out, "  Errors analysed:   {}", status.error_stats.total_errors);
    out
}

pub fn render_tools(groups: &[(ToolCategory, Vec<String>)]) -> String {
    if groups.is_empty() {
        return "No tools loaded or available.".to_string();
    }
    let mut out = String::new();
    for (category, names) in groups {
        let _ = writeln!(out, "{} ({}):", category.heading(), names.len());
        for name in names {
            let _ = writeln!(out, "  • {name}");
        }
    }
    out.trim_end().to_string()
}

pub fn render_insights(insights: &AgentInsights) -> String {
    let mut out = String::new();
    match &insights.context {
        None => out.push_str("Not enough data for analysis yet.\n"),
        Some(ctx) => {
            let _ = writeln!(out, "Operations:        {}", ctx.total_operations);
            let _ = writeln!(out, "Success rate:      {:.1}%", ctx.overall_success_rate);
            let _ = writeln!(out, "Average time:      {:.2}s", ctx.avg_execution_time);
            if !ctx.intent_statistics.is_empty() {
                out.push_str("By intent:\n");
                for (intent, s) in &ctx.intent_statistics {
                    let _ = writeln!(
                        out,
                        "  {intent}: {} runs, {:.1}% ok, {:.2}s avg",
                        s.total, s.success_rate, s.avg_time
                    );
                }
            }
            if !ctx.problematic_intents.is_empty() {
                let _ = writeln!(out, "Problematic:       {}", ctx.problematic_intents.join(", "));
            }
            if !ctx.most_used_tools.is_empty() {
                out.push_str("Tool usage:\n");
                for (tool, n) in &ctx.most_used_tools {
                    let _ = writeln!(out, "  {tool}: {n}");
                }
            }
        }
    }

    let errors = &insights.errors;
    let _ = writeln!(out, "Errors analysed:   {}", errors.total_errors);
    for (kind, n) in &errors.most_common {
        let _ = writeln!(out, "  {kind}: {n}");
    }
    out.trim_end().to_string()
}

pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}
