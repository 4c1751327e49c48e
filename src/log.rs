//! Value types and the replicated log.
//!
//! The log is a 1-indexed sequence of `(term, command)` entries. Index 0 is
//! the sentinel position before the first entry and carries an implicit
//! term of 0, which keeps the consistency checks uniform for the empty log.

use serde::{Deserialize, Serialize};

/// Logical epoch. Advanced by elections, never decreased on any one server.
pub type Term = u64;

/// Stable identifier of a cluster member, unique within the cluster.
pub type ServerId = u64;

/// 1-based position in the replicated log. 0 means "before the first entry".
pub type LogIndex = u64;

/// Per-sender monotonic counter correlating responses with requests.
pub type MessageId = u64;

/// Opaque command payload. The core never inspects it; it is handed to the
/// application state machine once the entry commits.
pub type Command = serde_json::Value;

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "_entryTerm")]
    pub term: Term,
    #[serde(rename = "_entryData")]
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, command: Command) -> Self {
        Self { term, command }
    }
}

/// The replicated log. Entries occupy indices `1..=len` contiguously and
/// their terms are non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(rename = "_logEntries")]
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, which is also the index of the last entry.
    pub fn len(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`, or None for the sentinel 0 and out-of-range indices.
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term at `index`. `Some(0)` for the sentinel, None past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Index of the last entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.len()
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Appends an entry, returning its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        debug_assert!(
            entry.term >= self.last_term(),
            "log terms must be non-decreasing: {} after {}",
            entry.term,
            self.last_term()
        );
        self.entries.push(entry);
        self.len()
    }

    /// Drops every entry at `index` and beyond. No-op past the end.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate(index as usize - 1);
        }
    }

    /// Entries paired with their indices, `1..=len`.
    pub fn iter_indexed(&self) -> impl Iterator<Item = (LogIndex, &LogEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as LogIndex + 1, e))
    }

    /// Indexed entries starting at `from` (clamped to the valid range).
    pub fn entries_from(&self, from: LogIndex) -> Vec<(LogIndex, LogEntry)> {
        self.iter_indexed()
            .filter(|(i, _)| *i >= from)
            .map(|(i, e)| (i, e.clone()))
            .collect()
    }
}
