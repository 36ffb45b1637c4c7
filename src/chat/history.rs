//! In-memory chat transcript.

use std::fmt::Write as _;

use chrono::{DateTime, Local};

/// Once the transcript exceeds this many entries it is trimmed...
pub const MAX_HISTORY: usize = 1000;
/// ...down to the newest this many.
pub const TRIM_TO: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Agent,
    Error,
}

impl EntryKind {
    pub const fn title(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Agent => "Agent",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Local>,
    pub kind: EntryKind,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    entries: Vec<HistoryEntry>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: EntryKind, content: impl Into<String>) {
        self.entries.push(HistoryEntry {
            timestamp: Local::now(),
            kind,
            content: content.into(),
        });
        if self.entries.len() > MAX_HISTORY {
            let excess = self.entries.len() - TRIM_TO;
            self.entries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> &[HistoryEntry] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    pub fn to_markdown(&self, generated: DateTime<Local>) -> String {
        let mut md = String::from("# Gemini AI Agent Chat History\n\n");
        let _ = write!(md, "Generated: {}\n\n", generated.format("%Y-%m-%d %H:%M:%S"));
        for entry in &self.entries {
            let _ = write!(
                md,
                "## {} [{}]\n\n{}\n\n---\n\n",
                entry.kind.title(),
                entry.timestamp.format("%H:%M:%S"),
                entry.content.trim_end()
            );
        }
        md
    }
}
