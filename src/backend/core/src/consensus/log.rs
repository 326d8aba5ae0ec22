//! Replicated log entries and their durable storage.
//!
//! Storage holds committed entries only. On restart the committed log is
//! reloaded and replayed through the normal apply path.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LogIndex, Term};
use crate::acl::Command;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Log Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A committed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Correlates the entry with the waiter of the submitting request.
    pub request_id: Uuid,
    pub command: Command,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable storage for committed entries.
pub trait LogStorage: Send + Sync {
    /// Persist one committed entry. Entries arrive in index order.
    fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Load every committed entry in index order.
    fn load(&self) -> Result<Vec<LogEntry>>;
}

/// Volatile storage; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemoryStorage {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().clone())
    }
}

/// JSON-lines file storage. One entry per line, fsynced on append.
pub struct FileStorage {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileStorage {
    /// File name of the log inside the data directory.
    pub const LOG_FILE: &'static str = "raft-log.jsonl";

    /// Open (or create) the log under `data_dir`.
    ///
    /// A torn final line left by a crash is truncated away so later appends
    /// start on a clean line.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(Self::LOG_FILE);
        let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;

        let (entries, valid_len) = scan(&path)?;
        if valid_len < file.metadata()?.len() {
            warn!(path = %path.display(), valid_len, "Truncating torn log tail");
            file.set_len(valid_len)?;
        }
        info!(path = %path.display(), entries = entries.len(), "Opened log storage");

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStorage for FileStorage {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<LogEntry>> {
        let (entries, _) = scan(&self.path)?;
        debug!(path = %self.path.display(), entries = entries.len(), "Loaded log");
        Ok(entries)
    }
}

/// Read entries up to the first unreadable line or index gap.
/// Returns the entries and the byte length of the intact prefix.
fn scan(path: &Path) -> Result<(Vec<LogEntry>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();
    let mut n = 0usize;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        n += 1;
        if !line.ends_with('\n') {
            warn!(line = n, "Incomplete log line, stopping replay");
            break;
        }
        if line.trim().is_empty() {
            valid_len += read as u64;
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => {
                let expected = entries.last().map_or(1, |e| e.index + 1);
                if entry.index != expected {
                    warn!(line = n, index = entry.index, expected, "Log gap, stopping replay");
                    break;
                }
                entries.push(entry);
                valid_len += read as u64;
            }
            Err(e) => {
                warn!(line = n, error = %e, "Unreadable log line, stopping replay");
                break;
            }
        }
    }

    Ok((entries, valid_len))
}
