//! The replicated log
//!
//! Manages the ordered sequence of client commands with:
//! - 1-based indexing and an implicit sentinel at position 0
//! - appending on the leader, truncate-then-extend on followers
//! - term lookups for the consistency and conflict checks

use crate::{LogIndex, NodeId, RaftError, RaftResult, Term};
use serde::{Deserialize, Serialize};

/// The client command a log entry carries.
///
/// The origin client and request identifier ride with the command so that
/// whichever replica applies the entry as leader can acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub key: String,
    pub value: String,
    /// Client that issued the command
    pub client: NodeId,
    /// Request identifier, echoed verbatim on the response
    #[serde(rename = "MID")]
    pub mid: String,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader
    pub term: Term,
    #[serde(flatten)]
    pub command: Command,
}

/// The replicated log.
///
/// Externally 1-indexed: index `i` lives at `entries[i - 1]`. Position 0 is
/// a permanent sentinel with term 0 and no command; it is never stored, but
/// every lookup accounts for it, so `last_index()` of an empty log is 0 and
/// `term_at(0)` is 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of log positions, counting the sentinel.
    pub fn len(&self) -> LogIndex {
        self.entries.len() as LogIndex + 1
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry (0 when only the sentinel is present).
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Term of the last entry (the sentinel's term 0 on an empty log).
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, `None` past the end of the log.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    /// Entry at `index`; the sentinel yields `None`.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// All entries from `start` (1-based) to the end of the log.
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let start = start.max(1) as usize;
        self.entries.iter().skip(start - 1).cloned().collect()
    }

    /// Append one command under `term`, returning its index.
    pub fn append(&mut self, term: Term, command: Command) -> LogIndex {
        self.entries.push(LogEntry { term, command });
        self.last_index()
    }

    /// Truncate to the prefix of `len` positions (counting the sentinel).
    ///
    /// Only an authoritative leader may cause this, via append-entries. The
    /// sentinel itself can never be discarded.
    pub fn truncate_to(&mut self, len: LogIndex) -> RaftResult<()> {
        if len == 0 {
            return Err(RaftError::InvalidLogIndex(len));
        }
        self.entries.truncate(len as usize - 1);
        Ok(())
    }

    /// Append replicated entries in order after a truncation.
    pub fn extend(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    /// Whether the log holds an entry at `index` with the given `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        if index == 0 {
            return true;
        }
        self.term_at(index) == Some(term)
    }

    /// First index whose entry carries `term`, for conflict acceleration.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .position(|e| e.term == term)
            .map(|p| p as LogIndex + 1)
    }
}
