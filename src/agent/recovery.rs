//! Error classification and recovery suggestions.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::resilience::{DEFAULT_RATE_LIMIT_DELAY, extract_retry_delay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Tool,
    Validation,
    Permission,
    NotFound,
    Network,
    RateLimit,
    Syntax,
    Unknown,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Syntax => "syntax",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static ERROR_PATTERNS: LazyLock<Vec<(Regex, ErrorKind, f32)>> = LazyLock::new(|| {
    [
        (r"(file not found|no such file)", ErrorKind::NotFound, 0.9),
        (r"(permission denied|access denied)", ErrorKind::Permission, 0.95),
        (r"(invalid path|illegal characters)", ErrorKind::Validation, 0.9),
        (r"(connection error|network error|timeout|timed out)", ErrorKind::Network, 0.8),
        (r"(rate limit|too many requests)", ErrorKind::RateLimit, 0.95),
        (r"(tool error|command failed)", ErrorKind::Tool, 0.85),
        (r"(syntax error|invalid syntax)", ErrorKind::Syntax, 0.9),
    ]
    .into_iter()
    .filter_map(|(p, kind, confidence)| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .ok()
            .map(|re| (re, kind, confidence))
    })
    .collect()
});

static QUOTED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).ok());

/// A suggested next step after a failure. Lower `priority` comes first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAction {
    pub action: &'static str,
    pub description: String,
    pub parameters: serde_json::Value,
    pub priority: u8,
}

impl RecoveryAction {
    fn new(action: &'static str, description: impl Into<String>, priority: u8) -> Self {
        Self {
            action,
            description: description.into(),
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            priority,
        }
    }

    fn with_params(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total_errors: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    /// Up to five kinds, most frequent first.
    pub most_common: Vec<(ErrorKind, usize)>,
    pub cache_size: usize,
    pub avg_actions_per_error: f64,
}

/// Classifies error text and suggests recovery actions.
#[derive(Debug, Default)]
pub struct ErrorRecovery {
    total_errors: usize,
    by_kind: BTreeMap<ErrorKind, usize>,
    cache: HashMap<(ErrorKind, String), Vec<RecoveryAction>>,
}

/// Highest-confidence matching kind, or `Unknown`.
pub fn classify(message: &str) -> ErrorKind {
    let mut best = ErrorKind::Unknown;
    let mut best_confidence = 0.0_f32;
    for (re, kind, confidence) in ERROR_PATTERNS.iter() {
        if *confidence > best_confidence && re.is_match(message) {
            best = *kind;
            best_confidence = *confidence;
        }
    }
    best
}

/// Seconds to wait before retrying a rate-limited call.
pub fn wait_time_secs(message: &str) -> u64 {
    extract_retry_delay(message)
        .unwrap_or(DEFAULT_RATE_LIMIT_DELAY)
        .as_secs()
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `message` and return suggested actions sorted by priority.
    ///
    /// `intent` names what the user was trying to do, when known.
    pub fn analyze(&mut self, message: &str, intent: Option<&str>) -> (ErrorKind, Vec<RecoveryAction>) {
        self.total_errors += 1;
        let kind = classify(message);
        *self.by_kind.entry(kind).or_default() += 1;

        let key = (kind, message.to_string());
        if let Some(actions) = self.cache.get(&key) {
            return (kind, actions.clone());
        }

        let mut actions = Self::actions_for(kind, message, intent);
        actions.sort_by_key(|a| a.priority);
        tracing::debug!(kind = %kind, actions = actions.len(), "Analysed error");
        self.cache.insert(key, actions.clone());
        (kind, actions)
    }

    fn actions_for(kind: ErrorKind, message: &str, intent: Option<&str>) -> Vec<RecoveryAction> {
        use serde_json::json;

        match kind {
            ErrorKind::NotFound => {
                let mut actions = Vec::new();
                let missing = QUOTED
                    .as_ref()
                    .and_then(|re| re.captures(message))
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                if let Some(path) = missing {
                    actions.push(
                        RecoveryAction::new(
                            "list_similar_files",
                            format!("Look for files similar to '{path}'"),
                            1,
                        )
                        .with_params(json!({"pattern": path, "fuzzy": true})),
                    );
                    actions.push(
                        RecoveryAction::new(
                            "suggest_create_file",
                            format!("Offer to create '{path}'"),
                            2,
                        )
                        .with_params(json!({"filename": path})),
                    );
                }
                actions.push(RecoveryAction::new(
                    "list_current_directory",
                    "List the contents of the working directory",
                    3,
                ));
                actions
            }
            ErrorKind::Permission => vec![
                RecoveryAction::new("use_safe_tool", "Use a safe tool instead", 1)
                    .with_params(json!({"prefer_safe": true})),
                RecoveryAction::new(
                    "check_permissions",
                    "Check access rights on the file or directory",
                    2,
                ),
            ],
            ErrorKind::Validation => vec![
                RecoveryAction::new("fix_path_format", "Fix the path format", 1)
                    .with_params(json!({"normalize": true, "escape_special": true})),
                RecoveryAction::new("validate_input", "Check the input values", 2),
            ],
            ErrorKind::Network => vec![
                RecoveryAction::new("retry_request", "Retry the request after a short delay", 1)
                    .with_params(json!({"delay": 2, "max_retries": 3})),
                RecoveryAction::new("use_alternative_endpoint", "Try an alternative source", 2),
            ],
            ErrorKind::RateLimit => {
                let wait = wait_time_secs(message);
                vec![
                    RecoveryAction::new(
                        "wait_and_retry",
                        format!("Wait {wait} seconds and try again"),
                        1,
                    )
                    .with_params(json!({"wait_time": wait})),
                    RecoveryAction::new("use_alternative_service", "Use an alternative service", 2),
                ]
            }
            ErrorKind::Tool => {
                let mut actions = Vec::new();
                if let Some(intent) = intent.filter(|i| !i.is_empty()) {
                    actions.push(
                        RecoveryAction::new(
                            "try_alternative_tool",
                            format!("Try another tool for '{intent}'"),
                            1,
                        )
                        .with_params(json!({"intent": intent, "exclude_failed": true})),
                    );
                }
                actions.push(RecoveryAction::new(
                    "check_tool_availability",
                    "Check which tools are available",
                    2,
                ));
                actions
            }
            ErrorKind::Syntax => vec![
                RecoveryAction::new("fix_syntax", "Fix the command syntax", 1)
                    .with_params(json!({"auto_correct": true})),
                RecoveryAction::new("suggest_correct_format", "Suggest the correct format", 2),
            ],
            ErrorKind::Unknown => vec![
                RecoveryAction::new("generic_retry", "Retry the operation", 1)
                    .with_params(json!({"delay": 1})),
                RecoveryAction::new("log_for_analysis", "Record the error for analysis", 3)
                    .with_params(json!({"error_message": message})),
            ],
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        let mut most_common: Vec<(ErrorKind, usize)> =
            self.by_kind.iter().map(|(k, n)| (*k, *n)).collect();
        most_common.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        most_common.truncate(5);

        #[allow(clippy::cast_precision_loss)]
        let avg_actions_per_error = if self.cache.is_empty() {
            0.0
        } else {
            self.cache.values().map(Vec::len).sum::<usize>() as f64 / self.cache.len() as f64
        };

        RecoveryStats {
            total_errors: self.total_errors,
            by_kind: self.by_kind.clone(),
            most_common,
            cache_size: self.cache.len(),
            avg_actions_per_error,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
