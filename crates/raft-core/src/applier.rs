//! # applier
//!
//! why: committed entries have to reach the application exactly once and in order
//! relations: drains RaftNode::get_entries_to_apply; raft-node runs it after every event
//! what: StateMachine trait, Applier, ApplyReport

use tracing::{debug, warn};

use crate::log::LogEntry;
use crate::node::RaftNode;
use crate::storage::Storage;
use crate::{LogIndex, Term};

/// The replicated application.
pub trait StateMachine {
    /// Apply one committed entry and return its result bytes.
    fn apply(&mut self, entry: &LogEntry) -> Vec<u8>;

    /// Highest index this machine has durably absorbed.
    ///
    /// Volatile machines keep the default of 0 and get the whole log
    /// replayed after a restart. A durable machine that records its index
    /// after applying may see one entry again after a crash, never a gap.
    fn last_applied(&self) -> LogIndex {
        0
    }
}

/// Outcome of applying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: LogIndex,
    pub term: Term,
    pub output: Vec<u8>,
}

/// Feeds committed entries from a node into a [`StateMachine`].
#[derive(Debug)]
pub struct Applier<M> {
    machine: M,
    applied: LogIndex,
}

impl<M: StateMachine> Applier<M> {
    pub fn new(machine: M) -> Self {
        let applied = machine.last_applied();
        Self { machine, applied }
    }

    /// Index of the last entry handed to the machine.
    pub fn applied_index(&self) -> LogIndex {
        self.applied
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn into_machine(self) -> M {
        self.machine
    }

    /// Apply everything `node` has committed since the last call.
    pub fn apply_committed<S: Storage>(&mut self, node: &mut RaftNode<S>) -> Vec<ApplyReport> {
        let mut reports = Vec::new();
        for entry in node.get_entries_to_apply() {
            if entry.index <= self.applied {
                // already absorbed before a restart
                continue;
            }
            if entry.index != self.applied + 1 {
                warn!(
                    node = node.id(),
                    expected = self.applied + 1,
                    got = entry.index,
                    "applier skipped ahead"
                );
            }
            let output = self.machine.apply(&entry);
            self.applied = entry.index;
            reports.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                output,
            });
        }
        if let Some(last) = reports.last() {
            debug!(node = node.id(), applied = last.index, "applied committed entries");
        }
        reports
    }
}
