//! # storage
//!
//! why: the core must persist term, vote and log before acknowledging anything
//! relations: owned by log.rs through RaftLog; FileStorage lives in raft-storage
//! what: Storage trait, InMemoryStorage for tests and simulations

use std::io;

use crate::log::LogEntry;
use crate::{NodeId, Term};

/// Durable storage for the state Raft needs across restarts.
///
/// Implementations must not return from a mutating call until the data is
/// flushed; the consensus core replies to peers right after these return.
///
/// This abstraction allows the same core to run against:
/// - the filesystem (`raft_storage::FileStorage`)
/// - memory (tests, simulations)
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;

    /// load the persisted term and voted_for, `(0, None)` for a fresh node
    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// drop every entry with index >= from_index (conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> io::Result<()>;
}

/// in-memory storage, nothing survives the process
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded storage, as if a node had crashed with this state on disk.
    pub fn with_state(term: Term, voted_for: Option<NodeId>, log: Vec<LogEntry>) -> Self {
        Self {
            term,
            voted_for,
            log,
        }
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_storage_persists_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(5, Some(2)).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (5, Some(2)));
    }

    #[test]
    fn in_memory_storage_truncates_log() {
        let mut storage = InMemoryStorage::new();
        let entries = vec![
            LogEntry::new(1, 1, vec![1]),
            LogEntry::new(1, 2, vec![2]),
            LogEntry::new(1, 3, vec![3]),
        ];
        storage.append_entries(&entries).unwrap();

        storage.truncate_log_from(2).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index, 1);
    }

    #[test]
    fn seeded_storage_loads_its_state() {
        let storage = InMemoryStorage::with_state(4, Some(3), vec![LogEntry::new(2, 1, vec![])]);

        assert_eq!(storage.load_term_and_vote().unwrap(), (4, Some(3)));
        assert_eq!(storage.load_log().unwrap().len(), 1);
    }
}
