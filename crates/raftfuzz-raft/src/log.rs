//! The replicated log and the durable portion of node state.

use crate::message::{Entry, ReplicaId};

/// In-memory replicated log. Entry indices are 1-based; `entries[0]` holds
/// the entry at index 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<Entry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild from previously-persisted entries.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    /// Index of the last entry, or 0 for an empty log.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Term of the last entry, or 0 for an empty log.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Term of the entry at `index`, if present. Index 0 maps to term 0.
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    /// Whether the log contains an entry at `index` with term `term`.
    /// Used for the AppendEntries consistency check.
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term(index) == Some(term)
    }

    /// Append `entries` starting after `prev_index`, truncating any
    /// conflicting suffix first. Entries already present with the same term
    /// are left untouched.
    pub fn append(&mut self, prev_index: u64, entries: &[Entry]) {
        for entry in entries {
            let pos = entry.index as usize - 1;
            match self.entries.get(pos) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    self.entries.truncate(pos);
                    self.entries.push(entry.clone());
                }
                None => self.entries.push(entry.clone()),
            }
        }
        debug_assert!(prev_index <= self.last_index());
    }

    /// Push a single new entry at the tail.
    pub fn push(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Entries from `index` (1-based, inclusive) to the tail.
    pub fn entries_from(&self, index: u64) -> &[Entry] {
        let start = (index.max(1) as usize - 1).min(self.entries.len());
        &self.entries[start..]
    }

    /// The prefix of the log up to and including `commit`.
    pub fn committed(&self, commit: u64) -> &[Entry] {
        let end = (commit as usize).min(self.entries.len());
        &self.entries[..end]
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The node state that survives a crash: log entries, current term and the
/// vote cast in it. Everything else (role, timers, commit index) is rebuilt
/// from messages after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableState {
    pub term: u64,
    pub voted_for: Option<ReplicaId>,
    pub entries: Vec<Entry>,
}
