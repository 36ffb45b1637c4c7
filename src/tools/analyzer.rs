//! Tool categorisation for the system prompt.
//!
//! Tools are matched by their raw server-side name and their description
//! against an ordered list of case-insensitive patterns. The first category
//! with a matching pattern wins.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::mcp::RegisteredTool;

const MAX_DESCRIPTION_CHARS: usize = 150;
const OTHER_WARN_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    ReadFile,
    WriteFile,
    ListDirectory,
    CreateDirectory,
    DeleteFile,
    MoveFile,
    Search,
    WebSearch,
    FetchUrl,
    Other,
}

impl ToolCategory {
    /// Matching order. `Other` is the fallback and has no patterns.
    pub const ALL: [Self; 10] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::ListDirectory,
        Self::CreateDirectory,
        Self::DeleteFile,
        Self::MoveFile,
        Self::Search,
        Self::WebSearch,
        Self::FetchUrl,
        Self::Other,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ListDirectory => "list_directory",
            Self::CreateDirectory => "create_directory",
            Self::DeleteFile => "delete_file",
            Self::MoveFile => "move_file",
            Self::Search => "search",
            Self::WebSearch => "web_search",
            Self::FetchUrl => "fetch_url",
            Self::Other => "other",
        }
    }

    /// Section heading used in the prompt's tool listing.
    pub const fn heading(self) -> &'static str {
        match self {
            Self::ReadFile => "READING FILES",
            Self::WriteFile => "CREATING/WRITING FILES",
            Self::ListDirectory => "BROWSING DIRECTORIES",
            Self::CreateDirectory => "CREATING FOLDERS",
            Self::DeleteFile => "DELETING FILES/FOLDERS",
            Self::MoveFile => "MOVING/RENAMING",
            Self::Search => "FILE SEARCH",
            Self::WebSearch => "WEB SEARCH",
            Self::FetchUrl => "DOWNLOADING FROM THE INTERNET",
            Self::Other => "OTHER TOOLS",
        }
    }

    const fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::ReadFile => &[
                r"^(read|get|cat|show|view)_file$",
                r"^read_.*_file$",
                r"^get_file_.*$",
            ],
            Self::WriteFile => &[
                r"^(write|create|save|put)_file$",
                r"^(write|create)_.*_file$",
                r"^edit_file$",
            ],
            Self::ListDirectory => &[
                r"^list_.*",
                r"^ls$",
                r"^dir$",
                r".*(directory|dir|folder).*list.*",
                r".*list.*(directory|dir|folder).*",
                r"^directory_tree$",
            ],
            Self::CreateDirectory => &[
                r"^create_.*(directory|dir|folder)$",
                r"^mkdir$",
                r"^make_.*dir$",
            ],
            Self::DeleteFile => &[r"^(delete|remove|rm|unlink)_.*", r"^safe_delete_.*"],
            Self::MoveFile => &[r"^(move|mv|rename)_.*"],
            Self::Search => &[r"^(search|find|grep)_files?$", r"^search$"],
            Self::WebSearch => &[r".*(web|internet|duckduckgo|google).*search.*"],
            Self::FetchUrl => &[r"^(fetch|download|get)_url$", r".*fetch.*"],
            Self::Other => &[],
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

static CATEGORY_PATTERNS: LazyLock<Vec<(ToolCategory, Vec<Regex>)>> = LazyLock::new(|| {
    ToolCategory::ALL
        .iter()
        .map(|c| (*c, c.patterns().iter().filter_map(|p| compile(p)).collect()))
        .collect()
});

static FALLBACK_DESCRIPTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"safe_delete_file", "Safely deletes files only inside the working directory"),
        (r"safe_delete_directory", "Safely deletes directories only inside the working directory"),
        (r"(read|get|cat|show|view).*file", "Reads the contents of a file"),
        (r"(write|create|save|put).*file", "Creates or writes a file"),
        (r"create.*(directory|dir|folder)", "Creates a new folder"),
        (r"mkdir", "Creates a new folder"),
        (r".*(web|internet|duckduckgo|google).*search", "Searches the internet"),
        (r"(fetch|download|get).*url", "Downloads data from a URL"),
        (r"(read|get)_.*", "Reads data"),
        (r"(write|create)_.*", "Creates or writes data"),
        (r"(list|ls|dir).*", "Shows directory contents"),
        (r".*(directory|dir|folder).*list", "Shows directory contents"),
        (r"(delete|remove|rm|unlink).*", "Deletes a file or folder"),
        (r"(move|mv|rename).*", "Moves or renames a file"),
        (r"(search|find|grep).*file", "Searches for files"),
        (r"(search|find).*", "Performs a search"),
        (r"(http|https|url).*", "Works with web resources"),
        (r"(shell|exec|run|command).*", "Runs system commands"),
        (r".*server.*", "MCP server tool"),
        (r".*mcp.*", "Model Context Protocol tool"),
    ]
    .into_iter()
    .filter_map(|(p, d)| compile(p).map(|re| (re, d)))
    .collect()
});

/// Category of a single tool, from its raw name or description.
pub fn categorize(raw_name: &str, description: &str) -> ToolCategory {
    for (category, patterns) in CATEGORY_PATTERNS.iter() {
        if patterns
            .iter()
            .any(|re| re.is_match(raw_name) || re.is_match(description))
        {
            return *category;
        }
    }
    ToolCategory::Other
}

/// Description shown for a tool in the prompt listing.
pub fn describe(tool: &RegisteredTool) -> String {
    let desc = tool.description.trim();
    if !desc.is_empty() {
        if desc.chars().count() > MAX_DESCRIPTION_CHARS {
            let cut: String = desc.chars().take(MAX_DESCRIPTION_CHARS).collect();
            return format!("{cut}...");
        }
        return desc.to_string();
    }

    FALLBACK_DESCRIPTIONS
        .iter()
        .find(|(re, _)| re.is_match(&tool.raw_name))
        .map_or_else(|| format!("Tool: {}", tool.name), |(_, d)| (*d).to_string())
}

/// Tools grouped by category.
#[derive(Debug, Clone, Default)]
pub struct ToolAnalyzer {
    by_category: BTreeMap<ToolCategory, Vec<RegisteredTool>>,
    total: usize,
}

impl ToolAnalyzer {
    pub fn analyze(tools: &[RegisteredTool]) -> Self {
        let mut by_category: BTreeMap<ToolCategory, Vec<RegisteredTool>> = BTreeMap::new();
        for tool in tools {
            let category = categorize(&tool.raw_name, &tool.description);
            by_category.entry(category).or_default().push(tool.clone());
        }

        for (category, list) in &by_category {
            let names: Vec<&str> = list.iter().map(|t| t.name.as_str()).collect();
            tracing::info!(category = %category, tools = ?names, "Categorised tools");
        }

        let analyzer = Self {
            by_category,
            total: tools.len(),
        };

        let other = analyzer.tools_in(ToolCategory::Other).len();
        if analyzer.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let ratio = other as f64 / analyzer.total as f64;
            if ratio > OTHER_WARN_RATIO {
                tracing::warn!(
                    other,
                    total = analyzer.total,
                    "Many tools fell into the 'other' category; categorisation patterns may need updating"
                );
            }
        }

        analyzer
    }

    pub fn tools_in(&self, category: ToolCategory) -> &[RegisteredTool] {
        self.by_category.get(&category).map_or(&[], Vec::as_slice)
    }

    /// Non-empty categories with their exposed tool names, in matching order.
    pub fn summary(&self) -> Vec<(ToolCategory, Vec<String>)> {
        self.by_category
            .iter()
            .map(|(c, tools)| (*c, tools.iter().map(|t| t.name.clone()).collect()))
            .collect()
    }

    /// Category of a tool by the name the model uses for it.
    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.by_category
            .iter()
            .find(|(_, tools)| tools.iter().any(|t| t.name == name))
            .map(|(c, _)| *c)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Render the tool listing substituted into the system prompt.
    pub fn describe_tools(&self) -> String {
        let mut lines = Vec::new();
        for (category, tools) in &self.by_category {
            lines.push(format!("\n{}:", category.heading()));
            for tool in tools {
                lines.push(format!("  • {}: {}", tool.name, describe(tool)));
            }
        }
        if lines.is_empty() {
            lines.push("\nNo tools loaded or available.".to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: Option<&str>, raw: &str, description: &str) -> RegisteredTool {
        RegisteredTool {
            name: server.map_or_else(|| raw.to_string(), |s| format!("{s}__{raw}")),
            server: server.map(ToString::to_string),
            raw_name: raw.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_categorize_by_name() {
        assert_eq!(categorize("read_file", ""), ToolCategory::ReadFile);
        assert_eq!(categorize("Read_Multiple_File", ""), ToolCategory::ReadFile);
        assert_eq!(categorize("edit_file", ""), ToolCategory::WriteFile);
        assert_eq!(categorize("list_allowed_directories", ""), ToolCategory::ListDirectory);
        assert_eq!(categorize("directory_tree", ""), ToolCategory::ListDirectory);
        assert_eq!(categorize("create_directory", ""), ToolCategory::CreateDirectory);
        assert_eq!(categorize("safe_delete_file", ""), ToolCategory::DeleteFile);
        assert_eq!(categorize("move_file", ""), ToolCategory::MoveFile);
        assert_eq!(categorize("search_files", ""), ToolCategory::Search);
        assert_eq!(categorize("duckduckgo_web_search", ""), ToolCategory::WebSearch);
        assert_eq!(categorize("fetch", ""), ToolCategory::FetchUrl);
        assert_eq!(categorize("get_current_time", ""), ToolCategory::Other);
    }

    #[test]
    fn test_first_category_wins_and_description_matches() {
        // "list_" matches list_directory before anything later in the order.
        assert_eq!(categorize("list_search_results", ""), ToolCategory::ListDirectory);
        assert_eq!(
            categorize("query", "Run a Google search for the given terms"),
            ToolCategory::WebSearch
        );
    }

    #[test]
    fn test_describe_truncates_and_falls_back() {
        let long = "x".repeat(200);
        let d = describe(&tool(None, "thing", &long));
        assert_eq!(d.chars().count(), 153);
        assert!(d.ends_with("..."));

        assert_eq!(
            describe(&tool(None, "safe_delete_directory", "")),
            "Safely deletes directories only inside the working directory"
        );
        assert_eq!(describe(&tool(None, "mkdir", "")), "Creates a new folder");
        assert_eq!(describe(&tool(Some("x"), "zzz", "")), "Tool: x__zzz");
    }

    #[test]
    fn test_describe_tools_block() {
        let analyzer = ToolAnalyzer::analyze(&[
            tool(Some("filesystem"), "read_file", "Read a file"),
            tool(Some("filesystem"), "write_file", "Write a file"),
            tool(None, "safe_delete_file", "Delete a file"),
        ]);
        let text = analyzer.describe_tools();
        assert!(text.contains("READING FILES:\n  • filesystem__read_file: Read a file"));
        assert!(text.contains("DELETING FILES/FOLDERS:"));
        assert!(!text.contains("OTHER TOOLS"));
        assert_eq!(analyzer.tools_in(ToolCategory::WriteFile).len(), 1);
        assert_eq!(analyzer.total(), 3);

        let read_pos = text.find("READING FILES").unwrap();
        let delete_pos = text.find("DELETING FILES").unwrap();
        assert!(read_pos < delete_pos);
    }

    #[test]
    fn test_no_tools() {
        let analyzer = ToolAnalyzer::analyze(&[]);
        assert_eq!(analyzer.describe_tools(), "\nNo tools loaded or available.");
        assert!(analyzer.summary().is_empty());
    }
}
