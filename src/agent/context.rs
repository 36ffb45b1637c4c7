//! Bounded log of agent operations with running statistics.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Success rate (percent) below which an intent is flagged.
const PROBLEMATIC_SUCCESS_RATE: f64 = 80.0;
/// Runs needed before an intent can be flagged.
const PROBLEMATIC_MIN_RUNS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    UserAction,
    FileOperation,
    ToolUsage,
    ErrorState,
    SuccessState,
}

impl ContextKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserAction => "user_action",
            Self::FileOperation => "file_operation",
            Self::ToolUsage => "tool_usage",
            Self::ErrorState => "error_state",
            Self::SuccessState => "success_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    #[serde(rename = "type")]
    pub kind: ContextKind,
    pub intent: String,
    pub params: Value,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub tool_used: Option<String>,
    /// Seconds.
    pub execution_time: f64,
}

impl ContextEntry {
    pub fn new(kind: ContextKind, intent: impl Into<String>, params: Value) -> Self {
        Self {
            kind,
            intent: intent.into(),
            params,
            timestamp: Utc::now(),
            success: true,
            error: None,
            tool_used: None,
            execution_time: 0.0,
        }
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Option<String>) -> Self {
        self.tool_used = tool;
        self
    }

    #[must_use]
    pub fn with_execution_time(mut self, secs: f64) -> Self {
        self.execution_time = secs;
        self
    }
}

/// Running statistics. Counters cover every entry ever recorded; rates and
/// averages cover the retained window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextStats {
    pub total_entries: usize,
    pub success_rate: f64,
    pub avg_execution_time: f64,
    pub intent_counts: BTreeMap<String, usize>,
    pub error_patterns: BTreeMap<String, usize>,
    pub tool_usage: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentStats {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub avg_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextInsights {
    pub total_operations: usize,
    pub overall_success_rate: f64,
    pub avg_execution_time: f64,
    pub intent_statistics: BTreeMap<String, IntentStats>,
    pub problematic_intents: Vec<String>,
    pub most_used_tools: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!("unsupported export format: {other}")),
        }
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    context_history: &'a VecDeque<ContextEntry>,
    statistics: &'a ContextStats,
}

#[derive(Debug, Clone)]
pub struct ContextManager {
    entries: VecDeque<ContextEntry>,
    max_entries: usize,
    stats: ContextStats,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl ContextManager {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
            stats: ContextStats::default(),
        }
    }

    pub fn add(&mut self, entry: ContextEntry) {
        tracing::debug!(
            intent = %entry.intent,
            kind = entry.kind.as_str(),
            success = entry.success,
            execution_time = entry.execution_time,
            "Recorded context entry"
        );

        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        self.stats.total_entries += 1;
        *self
            .stats
            .intent_counts
            .entry(entry.intent.clone())
            .or_default() += 1;
        if let Some(tool) = &entry.tool_used {
            *self.stats.tool_usage.entry(tool.clone()).or_default() += 1;
        }
        if let (false, Some(error)) = (entry.success, &entry.error) {
            *self.stats.error_patterns.entry(error.clone()).or_default() += 1;
        }

        self.entries.push_back(entry);
        self.refresh_rates();
    }

    fn refresh_rates(&mut self) {
        let n = self.entries.len();
        let ok = self.entries.iter().filter(|e| e.success).count();
        let time: f64 = self.entries.iter().map(|e| e.execution_time).sum();
        self.stats.success_rate = ratio(ok, n) * 100.0;
        #[allow(clippy::cast_precision_loss)]
        let avg = if n == 0 { 0.0 } else { time / n as f64 };
        self.stats.avg_execution_time = avg;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ContextEntry> {
        self.entries.back()
    }

    pub fn last_of(&self, kind: ContextKind) -> Option<&ContextEntry> {
        self.entries.iter().rev().find(|e| e.kind == kind)
    }

    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    pub fn insights(&self) -> Option<ContextInsights> {
        if self.entries.is_empty() {
            return None;
        }

        let mut acc: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
        for e in &self.entries {
            let slot = acc.entry(e.intent.clone()).or_default();
            slot.0 += 1;
            if e.success {
                slot.1 += 1;
            }
            slot.2 += e.execution_time;
        }

        let intent_statistics: BTreeMap<String, IntentStats> = acc
            .into_iter()
            .map(|(intent, (total, successful, time))| {
                #[allow(clippy::cast_precision_loss)]
                let avg_time = time / total as f64;
                (
                    intent,
                    IntentStats {
                        total,
                        successful,
                        success_rate: ratio(successful, total) * 100.0,
                        avg_time,
                    },
                )
            })
            .collect();

        let problematic_intents = intent_statistics
            .iter()
            .filter(|(_, s)| s.success_rate < PROBLEMATIC_SUCCESS_RATE && s.total >= PROBLEMATIC_MIN_RUNS)
            .map(|(i, _)| i.clone())
            .collect();

        Some(ContextInsights {
            total_operations: self.entries.len(),
            overall_success_rate: self.stats.success_rate,
            avg_execution_time: self.stats.avg_execution_time,
            intent_statistics,
            problematic_intents,
            most_used_tools: self.stats.tool_usage.clone(),
        })
    }

    /// Hints drawn from recent failures and tools that worked for `intent`.
    pub fn suggestions(&self, intent: &str) -> Vec<String> {
        let mut out = Vec::new();

        let mut errors: BTreeMap<&str, usize> = BTreeMap::new();
        for e in self.entries.iter().rev().take(10) {
            if !e.success && e.intent == intent {
                *errors
                    .entry(e.error.as_deref().unwrap_or("unknown error"))
                    .or_default() += 1;
            }
        }
        if let Some((error, _)) = errors.iter().max_by_key(|(_, n)| **n) {
            out.push("Recent attempts at this operation failed".to_string());
            out.push(format!("Most common error: {error}"));
        }

        let mut tools: BTreeMap<&str, usize> = BTreeMap::new();
        for e in self.entries.iter().rev() {
            if e.success && e.intent == intent {
                if let Some(tool) = &e.tool_used {
                    *tools.entry(tool).or_default() += 1;
                }
            }
        }
        if let Some((tool, _)) = tools.iter().max_by_key(|(_, n)| **n) {
            out.push(format!("Recommended tool: {tool}"));
        }

        out
    }

    pub fn clear(&mut self, keep_stats: bool) {
        self.entries.clear();
        if keep_stats {
            self.refresh_rates();
        } else {
            self.stats = ContextStats::default();
        }
        tracing::info!(keep_stats, "Context cleared");
    }

    pub fn export(&self, format: ExportFormat) -> Result<String, serde_json::Error> {
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&ExportDocument {
                context_history: &self.entries,
                statistics: &self.stats,
            }),
            ExportFormat::Markdown => Ok(self.export_markdown()),
        }
    }

    fn export_markdown(&self) -> String {
        let mut md = String::from("# Agent Context\n\n");
        let _ = writeln!(md, "Total operations: {}\n", self.entries.len());
        let _ = writeln!(md, "Overall success rate: {:.1}%\n", self.stats.success_rate);

        for e in &self.entries {
            let status = if e.success { "✅" } else { "❌" };
            let _ = writeln!(md, "- {status} **{}** ({})", e.intent, e.kind.as_str());
            let _ = writeln!(md, "  - Time: {}", e.timestamp.format("%Y-%m-%d %H:%M:%S"));
            if let Some(target) = e.params.get("target").and_then(Value::as_str) {
                let _ = writeln!(md, "  - Target: `{target}`");
            }
            if let Some(tool) = &e.tool_used {
                let _ = writeln!(md, "  - Tool: {tool}");
            }
            if let (false, Some(error)) = (e.success, &e.error) {
                let _ = writeln!(md, "  - Error: {error}");
            }
            md.push('\n');
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(intent: &str, ok: bool, secs: f64) -> ContextEntry {
        let e = ContextEntry::new(ContextKind::UserAction, intent, json!({}))
            .with_execution_time(secs);
        if ok { e } else { e.failed("boom") }
    }

    #[test]
    fn test_bounded_and_stats() {
        let mut ctx = ContextManager::new(3);
        ctx.add(entry("a", true, 1.0));
        ctx.add(entry("a", false, 3.0));
        ctx.add(entry("b", true, 2.0).with_tool(Some("read".into())));
        ctx.add(entry("b", true, 4.0));

        assert_eq!(ctx.len(), 3);
        let stats = ctx.stats();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.intent_counts["a"], 2);
        assert_eq!(stats.error_patterns["boom"], 1);
        assert_eq!(stats.tool_usage["read"], 1);
        assert!((stats.avg_execution_time - 3.0).abs() < 1e-9);
        assert!((stats.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(ctx.last().map(|e| e.intent.as_str()), Some("b"));
    }

    #[test]
    fn test_insights_flag_problematic_intents() {
        let mut ctx = ContextManager::new(20);
        assert!(ctx.insights().is_none());

        for ok in [true, false, false] {
            ctx.add(entry("flaky", ok, 1.0));
        }
        ctx.add(entry("rare", false, 1.0));
        for _ in 0..3 {
            ctx.add(entry("solid", true, 1.0));
        }

        let insights = ctx.insights().unwrap();
        assert_eq!(insights.total_operations, 7);
        assert_eq!(insights.problematic_intents, vec!["flaky".to_string()]);
        assert_eq!(insights.intent_statistics["solid"].success_rate, 100.0);
    }

    #[test]
    fn test_suggestions() {
        let mut ctx = ContextManager::new(20);
        ctx.add(entry("read_file", false, 1.0));
        ctx.add(entry("read_file", true, 1.0).with_tool(Some("filesystem__read_file".into())));
        let hints = ctx.suggestions("read_file");
        assert_eq!(hints.len(), 3);
        assert!(hints[1].contains("boom"));
        assert!(hints[2].contains("filesystem__read_file"));
        assert!(ctx.suggestions("other").is_empty());
    }

    #[test]
    fn test_clear() {
        let mut ctx = ContextManager::new(5);
        ctx.add(entry("a", true, 1.0));
        ctx.clear(true);
        assert!(ctx.is_empty());
        assert_eq!(ctx.stats().total_entries, 1);
        ctx.clear(false);
        assert_eq!(ctx.stats(), &ContextStats::default());
    }

    #[test]
    fn test_export_formats() {
        let mut ctx = ContextManager::new(5);
        ctx.add(
            ContextEntry::new(ContextKind::FileOperation, "delete_file", json!({"target": "a.txt"}))
                .failed("file not found: 'a.txt'")
                .with_tool(Some("safe_delete_file".into())),
        );

        let json_text = ctx.export(ExportFormat::Json).unwrap();
        let v: Value = serde_json::from_str(&json_text).unwrap();
        assert_eq!(v["context_history"][0]["type"], "file_operation");
        assert_eq!(v["statistics"]["total_entries"], 1);

        let md = ctx.export(ExportFormat::Markdown).unwrap();
        assert!(md.starts_with("# Agent Context"));
        assert!(md.contains("❌ **delete_file** (file_operation)"));
        assert!(md.contains("Target: `a.txt`"));
        assert!(md.contains("Tool: safe_delete_file"));

        assert_eq!("MD".parse::<ExportFormat>(), Ok(ExportFormat::Markdown));
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
