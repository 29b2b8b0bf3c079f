//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft_core::Storage; raft-node opens one per data_dir
//! what: FileStorage (meta.json + append-only log.jsonl), re-exports Storage and InMemoryStorage

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, LogIndex, NodeId, Term};
use thiserror::Error;
use tracing::{debug, warn};

pub use raft_core::{InMemoryStorage, Storage};

const META_FILE: &str = "meta.json";
const META_TEMP: &str = "meta.tmp";
const LOG_FILE: &str = "log.jsonl";
const LOG_TEMP: &str = "log.tmp";

/// Reasons an on-disk log is refused. Surfaced as `io::ErrorKind::InvalidData`.
#[derive(Debug, Error)]
pub enum CorruptLog {
    #[error("{file} line {line}: {source}")]
    BadLine {
        file: &'static str,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{file}: {source}")]
    BadMeta {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CorruptLog> for io::Error {
    fn from(err: CorruptLog) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one json entry per line, appended and fsynced
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    /// append handle, opened on first write
    log_file: Option<File>,
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// Open (or create) storage in `dir`.
    ///
    /// A partial line at the end of the log, left by a crash during an
    /// append that was never acknowledged, is cut off here.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        repair_torn_tail(&dir.join(LOG_FILE))?;
        debug!(dir = %dir.display(), "opened file storage");
        Ok(Self { dir, log_file: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Replace the whole log with `entries` via temp file + rename.
    fn rewrite_log(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let temp_path = self.dir.join(LOG_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&encode_lines(entries)?)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.log_path())?;
        sync_dir(&self.dir)?;
        // the old handle still points at the replaced file
        self.log_file = None;
        Ok(())
    }

    fn log_writer(&mut self) -> io::Result<&mut File> {
        let file = match self.log_file.take() {
            Some(file) => file,
            None => {
                let path = self.log_path();
                let created = !path.exists();
                let file = open_for_append(&path)?;
                if created {
                    sync_dir(&self.dir)?;
                }
                file
            }
        };
        Ok(self.log_file.insert(file))
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(META_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        // the rename itself is only durable once the directory is
        sync_dir(&self.dir)?;

        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }

        let contents = fs::read_to_string(&path)?;
        let meta: MetaData = serde_json::from_str(&contents).map_err(|source| CorruptLog::BadMeta {
            file: META_FILE,
            source,
        })?;

        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // one write per batch, then fsync before anyone acknowledges it
        let buf = encode_lines(entries)?;
        let file = self.log_writer()?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;

        let complete = match contents.rfind('\n') {
            Some(end) => &contents[..=end],
            None => "",
        };
        if complete.len() < contents.len() {
            warn!(path = %path.display(), bytes = contents.len() - complete.len(), "ignoring torn log tail");
        }

        let mut log = Vec::new();
        for (i, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(line).map_err(|source| CorruptLog::BadLine {
                file: LOG_FILE,
                line: i + 1,
                source,
            })?;
            log.push(entry);
        }
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> io::Result<()> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);
        if log.len() == before {
            return Ok(());
        }
        debug!(dir = %self.dir.display(), from_index, removed = before - log.len(), "truncating log");
        self.rewrite_log(&log)
    }

    fn clear(&mut self) -> io::Result<()> {
        remove_if_exists(&self.meta_path())?;
        self.log_file = None;
        remove_if_exists(&self.log_path())?;
        sync_dir(&self.dir)
    }
}

fn encode_lines(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Flush directory entries (creates, renames, removals) to disk.
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Drop bytes after the last newline so later appends start on a fresh line.
fn repair_torn_tail(path: &Path) -> io::Result<()> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    if keep < contents.len() {
        warn!(path = %path.display(), dropped = contents.len() - keep, "discarding torn log tail");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(keep as u64)?;
        file.sync_all()?;
    }
    Ok(())
}
