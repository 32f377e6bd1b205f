//! Append-only, hash-chained evidence ledger.
//!
//! The ledger is the system of record for every decision and its outcome:
//! one JSON line per entry, each entry content-hashed with its own hash
//! field blanked and chained to its predecessor through `prev_hash`. The
//! monotonic index comes from a separately persisted counter file; a crash
//! between counter increment and log write may leave a gap in `idx` (idx is
//! for ordering and tie-breaking, not exactness) but the hash chain must
//! never break.
//!
//! Writer exclusivity is explicit: a [`FileLedger`] holds an advisory
//! exclusive lock on a sidecar lock file for its lifetime, so a second
//! concurrent writer fails fast instead of corrupting the chain.
//!
//! Log codes:
//! - `TP-LEDGER-001`: entry appended
//! - `TP-LEDGER-002`: torn tail line dropped on open
//! - `TP-LEDGER-003`: chain verification failure

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::canonical::{content_hash, DOMAIN_LEDGER};

/// Sentinel `prev_hash` for the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

/// Canonical ledger log filename.
pub const LEDGER_FILE: &str = "ledger.jsonl";
/// Canonical counter filename.
pub const LEDGER_COUNTER_FILE: &str = "ledger.counter.json";
/// Canonical writer lock filename.
pub const LEDGER_LOCK_FILE: &str = "ledger.lock";

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// One immutable, content-hashed entry in the evidence ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic index (gaps permitted, regressions not).
    pub idx: u64,
    /// Machine-readable entry category, e.g. `tuning_applied`.
    pub entry_type: String,
    /// Open payload map; typed artifacts serialize into it at this boundary.
    pub payload: Value,
    /// Who/when/why metadata, not interpreted by the ledger.
    pub provenance: BTreeMap<String, String>,
    /// Hash of the previous entry, or [`GENESIS`].
    pub prev_hash: String,
    /// Content hash of this entry with this field blanked.
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Recompute this entry's content hash (with `entry_hash` blanked).
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let mut blanked = self.clone();
        blanked.entry_hash = String::new();
        content_hash(DOMAIN_LEDGER, &blanked).map_err(LedgerError::Serialize)
    }
}

/// Provenance map seeded with the emitting component and an RFC3339
/// timestamp. Timestamps live only here, never inside hashed decision
/// artifacts, so decision hashes stay replay-deterministic.
#[must_use]
pub fn base_provenance(component: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("component".to_string(), component.to_string());
    map.insert(
        "recorded_at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    map
}

// ---------------------------------------------------------------------------
// LedgerError
// ---------------------------------------------------------------------------

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to serialize ledger entry: {0}")]
    Serialize(serde_json::Error),
    #[error("I/O failure during {step} at {path}: {source}")]
    Io {
        step: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[error("ledger is locked by another writer at {path}")]
    Locked { path: String },
    #[error("corrupt ledger line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("hash chain violation at idx {idx}: {reason}")]
    ChainViolation { idx: u64, reason: String },
}

impl LedgerError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Serialize(_) => "LEDGER_SERIALIZE_FAILED",
            Self::Io { .. } => "LEDGER_IO_FAILED",
            Self::Locked { .. } => "LEDGER_LOCKED",
            Self::Corrupt { .. } => "LEDGER_CORRUPT_LINE",
            Self::ChainViolation { .. } => "LEDGER_CHAIN_VIOLATION",
        }
    }
}

fn io_err(step: &'static str, path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        step,
        path: path.display().to_string(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Counter file
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CounterFile {
    next_idx: u64,
}

fn read_counter(path: &Path) -> Result<u64, LedgerError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<CounterFile>(&bytes)
            .map(|c| c.next_idx)
            .map_err(|e| LedgerError::Corrupt {
                line: 0,
                reason: format!("counter file unparsable: {e}"),
            }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(io_err("read_counter", path, source)),
    }
}

fn write_counter(path: &Path, next_idx: u64) -> Result<(), LedgerError> {
    let payload = serde_json::to_vec(&CounterFile { next_idx }).map_err(LedgerError::Serialize)?;
    fs::write(path, payload).map_err(|source| io_err("write_counter", path, source))
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read every entry from a ledger directory, in file order.
///
/// A missing log file reads as empty. A torn final line (partial append
/// from a crash) is dropped; a corrupt interior line is an error.
pub fn read_all(dir: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let path = dir.join(LEDGER_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_err("read_log", &path, source)),
    };
    let lines: Vec<&str> = content.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i + 1 == lines.len() => {
                warn!(code = "TP-LEDGER-002", line = i + 1, error = %e, "dropping torn tail line");
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: i + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

/// Read the last `n` entries in file order (all, if fewer exist).
pub fn read_tail(dir: &Path, n: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut entries = read_all(dir)?;
    let start = entries.len().saturating_sub(n);
    Ok(entries.split_off(start))
}

/// Drop a torn final line (partial append from a crash) from the log file.
/// Writers call this on open so their next append starts on a clean line.
fn truncate_torn_tail(path: &Path) -> Result<(), LedgerError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_err("read_log", path, source)),
    };
    let trimmed = content.trim_end_matches('\n');
    if trimmed.is_empty() {
        return Ok(());
    }
    let (prefix, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    if serde_json::from_str::<LedgerEntry>(last).is_ok() {
        return Ok(());
    }
    warn!(code = "TP-LEDGER-002", "truncating torn tail line");
    fs::write(path, prefix).map_err(|source| io_err("truncate_torn_tail", path, source))
}

/// Walk the chain recomputing hashes and prev-links; returns the number of
/// verified entries or the first violation.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<u64, LedgerError> {
    let mut prev_hash = GENESIS.to_string();
    for entry in entries {
        let recomputed = entry.compute_hash()?;
        if recomputed != entry.entry_hash {
            warn!(code = "TP-LEDGER-003", idx = entry.idx, "entry hash mismatch");
            return Err(LedgerError::ChainViolation {
                idx: entry.idx,
                reason: "entry hash does not match recomputed content hash".to_string(),
            });
        }
        if entry.prev_hash != prev_hash {
            warn!(code = "TP-LEDGER-003", idx = entry.idx, "prev hash mismatch");
            return Err(LedgerError::ChainViolation {
                idx: entry.idx,
                reason: "prev_hash does not match predecessor entry hash".to_string(),
            });
        }
        prev_hash = entry.entry_hash.clone();
    }
    Ok(entries.len() as u64)
}

// ---------------------------------------------------------------------------
// FileLedger — the single writer
// ---------------------------------------------------------------------------

/// Exclusive writer handle over a ledger directory.
///
/// Opening acquires an advisory exclusive lock; the lock is released when
/// the handle is dropped. Readers ([`read_tail`], [`read_all`]) do not
/// take the lock.
#[derive(Debug)]
pub struct FileLedger {
    log_path: PathBuf,
    counter_path: PathBuf,
    // Held for the lifetime of the handle; dropping releases the lock.
    _lock_file: File,
    next_idx: u64,
    tail_hash: String,
}

impl FileLedger {
    /// Open (creating if necessary) the ledger in `dir` as its single writer.
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(dir).map_err(|source| io_err("create_dir", dir, source))?;
        let lock_path = dir.join(LEDGER_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| io_err("open_lock", &lock_path, source))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| LedgerError::Locked {
                path: lock_path.display().to_string(),
            })?;

        let log_path = dir.join(LEDGER_FILE);
        let counter_path = dir.join(LEDGER_COUNTER_FILE);
        truncate_torn_tail(&log_path)?;
        let entries = read_all(dir)?;
        let tail_hash = entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        let counter = read_counter(&counter_path)?;
        // The counter may run ahead of the log (crash gap); never behind.
        let next_idx = counter.max(entries.last().map_or(0, |e| e.idx + 1));

        Ok(Self {
            log_path,
            counter_path,
            _lock_file: lock_file,
            next_idx,
            tail_hash,
        })
    }

    /// The index the next appended entry will receive. Doubles as the
    /// ledger-clock (`now_idx`) for cooldown and safe-set expiry.
    #[must_use]
    pub fn next_idx(&self) -> u64 {
        self.next_idx
    }

    /// Hash of the current tail entry (or [`GENESIS`]).
    #[must_use]
    pub fn tail_hash(&self) -> &str {
        &self.tail_hash
    }

    /// Append one entry: persist the counter, compute the chained content
    /// hash, then durably append one line. The line is written only after
    /// the new entry hash is successfully computed, so the chain cannot be
    /// broken by a serialization failure.
    pub fn append(
        &mut self,
        entry_type: &str,
        payload: Value,
        provenance: BTreeMap<String, String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let idx = self.next_idx;
        write_counter(&self.counter_path, idx + 1)?;

        let mut entry = LedgerEntry {
            idx,
            entry_type: entry_type.to_string(),
            payload,
            provenance,
            prev_hash: self.tail_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;
        let line = serde_json::to_string(&entry).map_err(LedgerError::Serialize)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| io_err("open_log", &self.log_path, source))?;
        writeln!(file, "{line}").map_err(|source| io_err("append_log", &self.log_path, source))?;
        file.sync_data()
            .map_err(|source| io_err("fsync_log", &self.log_path, source))?;

        self.next_idx = idx + 1;
        self.tail_hash = entry.entry_hash.clone();
        debug!(
            code = "TP-LEDGER-001",
            idx,
            entry_type,
            hash = %&entry.entry_hash[..16.min(entry.entry_hash.len())],
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// Read the last `n` entries of this ledger.
    pub fn read_tail(&self, n: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let dir = self
            .log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        read_tail(&dir, n)
    }

    /// Verify the full chain on disk.
    pub fn verify(&self) -> Result<u64, LedgerError> {
        let dir = self
            .log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        verify_chain(&read_all(&dir)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn provenance() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("component".to_string(), "test".to_string());
        map
    }

    #[test]
    fn first_entry_links_to_genesis() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let entry = ledger
            .append("cycle_started", json!({"cycle": 1}), provenance())
            .expect("append");
        assert_eq!(entry.idx, 0);
        assert_eq!(entry.prev_hash, GENESIS);
        assert!(!entry.entry_hash.is_empty());
    }

    #[test]
    fn entries_chain_and_verify() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        for i in 0..5u64 {
            ledger
                .append("cycle_started", json!({"cycle": i}), provenance())
                .expect("append");
        }
        let entries = read_all(dir.path()).expect("read");
        assert_eq!(entries.len(), 5);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].entry_hash);
        }
        assert_eq!(verify_chain(&entries).expect("verify"), 5);
    }

    #[test]
    fn entry_hash_recomputes_with_field_blanked() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let entry = ledger
            .append("tuning_applied", json!({"module": "m"}), provenance())
            .expect("append");
        assert_eq!(entry.compute_hash().expect("recompute"), entry.entry_hash);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut ledger = FileLedger::open(dir.path()).expect("open");
            ledger
                .append("tuning_applied", json!({"v": 1}), provenance())
                .expect("append");
            ledger
                .append("tuning_applied", json!({"v": 2}), provenance())
                .expect("append");
        }
        let mut entries = read_all(dir.path()).expect("read");
        entries[0].payload = json!({"v": 99});
        let err = verify_chain(&entries).expect_err("tamper must fail");
        assert_eq!(err.code(), "LEDGER_CHAIN_VIOLATION");
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        assert!(read_all(dir.path()).expect("read").is_empty());
        assert!(read_tail(dir.path(), 10).expect("tail").is_empty());
    }

    #[test]
    fn read_tail_returns_last_n_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        for i in 0..6u64 {
            ledger
                .append("cycle_started", json!({"cycle": i}), provenance())
                .expect("append");
        }
        let tail = read_tail(dir.path(), 2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].payload["cycle"], 4);
        assert_eq!(tail[1].payload["cycle"], 5);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut ledger = FileLedger::open(dir.path()).expect("open");
            ledger
                .append("cycle_started", json!({}), provenance())
                .expect("append");
        }
        let ledger = FileLedger::open(dir.path()).expect("reopen");
        assert_eq!(ledger.next_idx(), 1);
    }

    #[test]
    fn counter_gap_is_tolerated_but_chain_is_continuous() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut ledger = FileLedger::open(dir.path()).expect("open");
            ledger
                .append("cycle_started", json!({}), provenance())
                .expect("append");
        }
        // Simulate a crash after counter increment but before the log write.
        write_counter(&dir.path().join(LEDGER_COUNTER_FILE), 5).expect("bump counter");
        let mut ledger = FileLedger::open(dir.path()).expect("reopen");
        let entry = ledger
            .append("cycle_started", json!({}), provenance())
            .expect("append");
        assert_eq!(entry.idx, 5);
        let entries = read_all(dir.path()).expect("read");
        assert_eq!(verify_chain(&entries).expect("verify"), 2);
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash);
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let _first = FileLedger::open(dir.path()).expect("open");
        let err = FileLedger::open(dir.path()).expect_err("second writer must fail");
        assert_eq!(err.code(), "LEDGER_LOCKED");
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = TempDir::new().expect("tempdir");
        {
            let _ledger = FileLedger::open(dir.path()).expect("open");
        }
        let _reopened = FileLedger::open(dir.path()).expect("reopen after drop");
    }

    #[test]
    fn torn_tail_line_is_dropped_on_open() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut ledger = FileLedger::open(dir.path()).expect("open");
            ledger
                .append("cycle_started", json!({}), provenance())
                .expect("append");
        }
        let log_path = dir.path().join(LEDGER_FILE);
        let mut content = fs::read_to_string(&log_path).expect("read");
        content.push_str("{\"idx\": 1, \"entry_ty");
        fs::write(&log_path, content).expect("write torn tail");

        let mut ledger = FileLedger::open(dir.path()).expect("reopen");
        let entry = ledger
            .append("cycle_started", json!({}), provenance())
            .expect("append after torn tail");
        assert_eq!(entry.idx, 1);
    }

    #[test]
    fn base_provenance_carries_component() {
        let p = base_provenance("router");
        assert_eq!(p["component"], "router");
        assert!(p.contains_key("recorded_at"));
    }
}
