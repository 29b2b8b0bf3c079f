//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, writes through to a Storage before changing its in-memory view
//! what: LogEntry struct, RaftLog with append / truncate / lookup

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, RaftResult};
use crate::storage::{InMemoryStorage, Storage};
use crate::{LogIndex, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// The replicated log, cached in memory and written through to storage.
///
/// Invariant: `entries[i].index == i + 1`. Every mutation hits storage
/// first, so if a write fails the in-memory view still matches disk.
#[derive(Debug)]
pub struct RaftLog<S> {
    entries: Vec<LogEntry>,
    storage: S,
}

impl RaftLog<InMemoryStorage> {
    /// An empty log backed by fresh in-memory storage.
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            storage: InMemoryStorage::new(),
        }
    }
}

impl<S: Storage> RaftLog<S> {
    /// Load the log persisted in `storage`, checking it is contiguous from 1.
    pub fn open(storage: S) -> RaftResult<Self> {
        let entries = storage.load_log()?;
        for (i, entry) in entries.iter().enumerate() {
            let expected = i as LogIndex + 1;
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: entry.index,
                });
            }
        }
        Ok(Self { entries, storage })
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|e| e.term)
    }

    /// Whether the log holds an entry at `index` with `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        let from = (start - 1) as usize;
        let to = (from + max).min(self.entries.len());
        self.entries[from..to].to_vec()
    }

    /// Entries in `(after, through]`.
    pub fn slice(&self, after: LogIndex, through: LogIndex) -> &[LogEntry] {
        let through = through.min(self.last_index());
        if after >= through {
            return &[];
        }
        &self.entries[after as usize..through as usize]
    }

    /// Append entries durably. They must continue the log without gaps.
    pub fn append(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }

        self.storage.append_entries(entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Durably remove every entry with index >= `index`.
    pub fn truncate_from(&mut self, index: LogIndex) -> RaftResult<()> {
        let index = index.max(1);
        if index > self.last_index() {
            return Ok(());
        }
        self.storage.truncate_log_from(index)?;
        self.entries.truncate((index - 1) as usize);
        Ok(())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
