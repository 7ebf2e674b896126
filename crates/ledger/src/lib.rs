//! Append-only hash-chained ledger of gated decisions.
//!
//! One JSON object per line. Each entry commits to its index, its
//! predecessor's hash, and a canonical serialization of its payload; any
//! rewrite of a committed line invalidates the chain from that point on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use warden_common::{canonical_json_bytes, sha256_hex, CanonError, GENESIS_HASH};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canon: {0}")]
    Canon(#[from] CanonError),
    #[error("malformed entry at line {line}: {detail}")]
    Malformed { line: usize, detail: String },
}

/// One committed line of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub idx: u64,
    pub prev_hash: String,
    pub entry_hash: String,
    pub payload: Value,
}

/// Hash an entry the way the chain commits to it: sha256 over the canonical
/// bytes of `{idx, prev_hash, payload}`. `entry_hash` itself is excluded.
pub fn compute_entry_hash(idx: u64, prev_hash: &str, payload: &Value) -> Result<String, CanonError> {
    let commit = serde_json::json!({
        "idx": idx,
        "prev_hash": prev_hash,
        "payload": payload,
    });
    Ok(sha256_hex(&canonical_json_bytes(&commit)?))
}

/// Single-writer appender for one ledger path.
///
/// Opening recovers the chain head from the final line alone; the file is
/// never loaded into memory past one line at a time. Concurrent appenders
/// to the same path are the caller's problem to serialize.
pub struct LedgerAppender {
    path: PathBuf,
    file: File,
    next_idx: u64,
    prev_hash: String,
}

impl LedgerAppender {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (next_idx, prev_hash) = match read_last_entry(&path)? {
            Some(last) => (last.idx + 1, last.entry_hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file,
            next_idx,
            prev_hash,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_idx(&self) -> u64 {
        self.next_idx
    }

    pub fn head_hash(&self) -> &str {
        &self.prev_hash
    }

    /// Commit one payload and return the entry as written.
    pub fn append(&mut self, payload: Value) -> Result<LedgerEntry, LedgerError> {
        let idx = self.next_idx;
        let entry_hash = compute_entry_hash(idx, &self.prev_hash, &payload)?;
        let entry = LedgerEntry {
            idx,
            prev_hash: self.prev_hash.clone(),
            entry_hash: entry_hash.clone(),
            payload,
        };

        let line = serde_json::to_vec(&entry)?;
        self.file.write_all(&line)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;

        self.next_idx += 1;
        self.prev_hash = entry_hash;
        Ok(entry)
    }
}

fn read_last_entry(path: &Path) -> Result<Option<LedgerEntry>, LedgerError> {
    if !path.exists() {
        return Ok(None);
    }
    let f = File::open(path)?;
    let rdr = BufReader::new(f);
    let mut last: Option<(usize, String)> = None;
    for (i, line) in rdr.lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some((i + 1, line));
        }
    }
    match last {
        None => Ok(None),
        Some((line_no, text)) => {
            let entry: LedgerEntry =
                serde_json::from_str(&text).map_err(|e| LedgerError::Malformed {
                    line: line_no,
                    detail: e.to_string(),
                })?;
            Ok(Some(entry))
        }
    }
}

/// Read every entry in file order. Missing file reads as empty.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, LedgerError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let f = File::open(path)?;
    let rdr = BufReader::new(f);
    let mut out = Vec::new();
    for (i, line) in rdr.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| LedgerError::Malformed {
            line: i + 1,
            detail: e.to_string(),
        })?;
        out.push(entry);
    }
    Ok(out)
}

/// Result of a chain-integrity pass.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub entry_count: u64,
    pub first_bad_index: Option<u64>,
    pub problems: Vec<String>,
}

impl ChainReport {
    pub fn ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Verify the whole chain, reporting every broken index.
///
/// Checks, per entry: `idx` is dense from 0; `prev_hash` links to the
/// predecessor's stored `entry_hash` (genesis for index 0); the recomputed
/// hash matches the stored one. A tampered entry therefore reports both
/// itself (hash mismatch) and its successor (broken link).
pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainReport, LedgerError> {
    let entries = read_entries(path)?;
    let mut problems = Vec::new();
    let mut first_bad_index: Option<u64> = None;
    let mut expected_prev = GENESIS_HASH.to_string();

    for (i, entry) in entries.iter().enumerate() {
        let i = i as u64;
        let mut bad = false;

        if entry.idx != i {
            problems.push(format!("entry {}: idx {} out of order", i, entry.idx));
            bad = true;
        }
        if entry.prev_hash != expected_prev {
            problems.push(format!(
                "entry {}: prev_hash {} does not link to {}",
                i, entry.prev_hash, expected_prev
            ));
            bad = true;
        }
        let recomputed = compute_entry_hash(entry.idx, &entry.prev_hash, &entry.payload)?;
        if recomputed != entry.entry_hash {
            problems.push(format!(
                "entry {}: entry_hash {} does not match recomputed {}",
                i, entry.entry_hash, recomputed
            ));
            bad = true;
        }

        if bad && first_bad_index.is_none() {
            first_bad_index = Some(i);
        }
        expected_prev = entry.entry_hash.clone();
    }

    // A broken entry poisons everything chained on top of it, even when
    // the later links are internally consistent.
    if let Some(bad_idx) = first_bad_index {
        let last = entries.len() as u64;
        if bad_idx + 1 < last {
            problems.push(format!(
                "entries {}..{} follow a broken entry and are untrusted",
                bad_idx + 1,
                last
            ));
        }
    }

    Ok(ChainReport {
        entry_count: entries.len() as u64,
        first_bad_index,
        problems,
    })
}
