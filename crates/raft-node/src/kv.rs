//! # kv
//!
//! why: give the cluster something concrete to replicate
//! relations: StateMachine driven by raft_core::Applier inside the runtime
//! what: KvCommand wire format, KvStore

use std::collections::BTreeMap;

use raft_core::{LogEntry, LogIndex, StateMachine};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A replicated key-value operation, stored as JSON in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// In-memory map rebuilt from the log after each restart.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    applied: LogIndex,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Index of the last entry applied.
    pub fn applied_index(&self) -> LogIndex {
        self.applied
    }
}

impl StateMachine for KvStore {
    /// Output is the previous value as JSON (`null` when there was none).
    fn apply(&mut self, entry: &LogEntry) -> Vec<u8> {
        self.applied = entry.index;
        let previous = match KvCommand::decode(&entry.command) {
            Ok(KvCommand::Set { key, value }) => self.data.insert(key, value),
            Ok(KvCommand::Delete { key }) => self.data.remove(&key),
            Err(err) => {
                warn!(index = entry.index, error = %err, "skipping undecodable kv command");
                return Vec::new();
            }
        };
        serde_json::to_vec(&previous).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, cmd: &KvCommand) -> LogEntry {
        LogEntry::new(1, index, cmd.encode().unwrap())
    }

    #[test]
    fn set_returns_previous_value() {
        let mut kv = KvStore::new();
        let first = kv.apply(&entry(1, &KvCommand::Set { key: "x".into(), value: "1".into() }));
        let second = kv.apply(&entry(2, &KvCommand::Set { key: "x".into(), value: "2".into() }));

        assert_eq!(first, b"null".to_vec());
        assert_eq!(second, br#""1""#.to_vec());
        assert_eq!(kv.get("x"), Some("2"));
        assert_eq!(kv.applied_index(), 2);
    }

    #[test]
    fn delete_removes_key() {
        let mut kv = KvStore::new();
        kv.apply(&entry(1, &KvCommand::Set { key: "x".into(), value: "1".into() }));
        kv.apply(&entry(2, &KvCommand::Delete { key: "x".into() }));

        assert!(kv.is_empty());
        assert_eq!(kv.get("x"), None);
    }

    #[test]
    fn garbage_command_is_skipped() {
        let mut kv = KvStore::new();
        let out = kv.apply(&LogEntry::new(1, 1, b"\xff not json".to_vec()));

        assert!(out.is_empty());
        assert!(kv.is_empty());
        assert_eq!(kv.applied_index(), 1);
    }

    #[test]
    fn command_wire_format() {
        let cmd = KvCommand::Set { key: "k".into(), value: "v".into() };
        assert_eq!(
            String::from_utf8(cmd.encode().unwrap()).unwrap(),
            r#"{"op":"set","key":"k","value":"v"}"#
        );
    }
}
