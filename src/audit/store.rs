//! Audit Log Store
//!
//! Owns the append-only log file and the file holding the current Merkle
//! root. Every append rereads the whole log and recomputes the root from
//! scratch; verification does the same and compares against the stored root.
//!
//! All appends go through one write lock scoped to the log+root pair, so the
//! order of entries in the file is the order in which writers acquired the
//! lock, not necessarily the order in which requests arrived.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::audit::entry::LogEntry;
use crate::audit::merkle::{generate_proof, merkle_root, MerkleProof};
use crate::error::{AuditError, Result};

/// Append-only audit log with a persisted Merkle root
#[derive(Debug)]
pub struct AuditLogStore {
    log_path: PathBuf,
    root_path: PathBuf,
    lock: RwLock<()>,
}

/// Outcome of a full integrity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub is_valid: bool,
    pub entry_count: usize,
    pub stored_root: Option<String>,
    pub computed_root: Option<String>,
}

impl VerificationReport {
    pub fn summary(&self) -> String {
        if self.is_valid {
            format!(
                "✅ Audit log is valid ({} entries, root: {})",
                self.entry_count,
                self.computed_root.as_deref().unwrap_or("none")
            )
        } else {
            format!(
                "❌ Audit log integrity mismatch ({} entries): stored root {}, computed root {}",
                self.entry_count,
                self.stored_root.as_deref().unwrap_or("missing"),
                self.computed_root.as_deref().unwrap_or("none")
            )
        }
    }
}

impl AuditLogStore {
    /// Create a store over the given files. Nothing is touched on disk until
    /// the first append.
    pub fn new(log_path: impl Into<PathBuf>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            root_path: root_path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Append an entry and return the new root.
    pub fn append(&self, entry: &LogEntry) -> Result<String> {
        let line = entry.canonical_json()?;
        let root = self.append_line(&line)?;
        debug!("Appended audit entry: {} (root {})", entry.summary(), root);
        Ok(root)
    }

    /// Like [`append`](Self::append), but gives up without touching the log
    /// if the write lock is only obtained after `deadline`.
    pub fn append_until(&self, entry: &LogEntry, deadline: Instant) -> Result<String> {
        let line = entry.canonical_json()?;
        let root = self.append_line_inner(&line, Some(deadline))?;
        debug!("Appended audit entry: {} (root {})", entry.summary(), root);
        Ok(root)
    }

    /// Append an already serialized entry and return the new root.
    ///
    /// The root is written before the entry. If the entry cannot be written
    /// the previous root and log length are restored.
    pub fn append_line(&self, line: &str) -> Result<String> {
        self.append_line_inner(line, None)
    }

    fn append_line_inner(&self, line: &str, deadline: Option<Instant>) -> Result<String> {
        if line.contains('\n') {
            return Err(AuditError::Serialization(
                "serialized entry spans multiple lines".to_string(),
            ));
        }

        let _guard = self.write_lock();

        // Queued behind a slow writer for longer than the caller would wait
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(AuditError::DeadlineExpired);
        }

        let existing = read_optional(&self.log_path, "Failed to read audit log")?;
        let previous_len = existing.len() as u64;
        let mut leaves = split_lines(&existing);
        let previous_root = self.read_root()?;

        // The new root covers the log as found, so a modification made since
        // the last append would be absorbed silently without this check.
        let found_root = if leaves.is_empty() {
            None
        } else {
            Some(merkle_root(&leaves)?)
        };
        if found_root != previous_root {
            error!(
                "Audit log {} no longer matches its stored root (stored {}, found {}); appending anyway",
                self.log_path.display(),
                previous_root.as_deref().unwrap_or("missing"),
                found_root.as_deref().unwrap_or("none")
            );
        }

        leaves.push(line.as_bytes());
        let root = merkle_root(&leaves)?;

        ensure_parent(&self.root_path)?;
        ensure_parent(&self.log_path)?;

        self.write_root(&root)?;

        let mut record = Vec::with_capacity(line.len() + 2);
        if !existing.is_empty() && !existing.ends_with(b"\n") {
            record.push(b'\n');
        }
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        if let Err(e) = self.write_record(&record) {
            self.rollback(previous_root.as_deref(), previous_len);
            return Err(e);
        }

        Ok(root)
    }

    /// Rebuild the tree over the whole log and compare with the stored root.
    pub fn verify(&self) -> Result<bool> {
        Ok(self.verify_detailed()?.is_valid)
    }

    /// Same check as [`verify`](Self::verify), with the roots involved.
    pub fn verify_detailed(&self) -> Result<VerificationReport> {
        let _guard = self.read_lock();

        let bytes = read_optional(&self.log_path, "Failed to read audit log")?;
        let leaves = split_lines(&bytes);
        let stored_root = self.read_root()?;

        let computed_root = if leaves.is_empty() {
            None
        } else {
            Some(merkle_root(&leaves)?)
        };

        // An empty log is only valid when no root claims otherwise
        let is_valid = computed_root == stored_root;

        let report = VerificationReport {
            is_valid,
            entry_count: leaves.len(),
            stored_root,
            computed_root,
        };

        if report.is_valid {
            info!("Audit log verification successful: {} entries", report.entry_count);
        } else {
            error!("{}", report.summary());
        }

        Ok(report)
    }

    /// All serialized entries in log order.
    pub fn entries(&self) -> Result<Vec<String>> {
        let _guard = self.read_lock();
        let bytes = read_optional(&self.log_path, "Failed to read audit log")?;
        Ok(split_lines(&bytes)
            .into_iter()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect())
    }

    pub fn entry_count(&self) -> Result<usize> {
        let _guard = self.read_lock();
        let bytes = read_optional(&self.log_path, "Failed to read audit log")?;
        Ok(split_lines(&bytes).len())
    }

    /// Root as last persisted, `None` before the first append.
    pub fn stored_root(&self) -> Result<Option<String>> {
        let _guard = self.read_lock();
        self.read_root()
    }

    /// Inclusion proof for the entry at `index` against the current log.
    pub fn prove(&self, index: usize) -> Result<MerkleProof> {
        let _guard = self.read_lock();
        let bytes = read_optional(&self.log_path, "Failed to read audit log")?;
        let leaves = split_lines(&bytes);
        if leaves.is_empty() {
            return Err(AuditError::IndexOutOfRange { index, len: 0 });
        }
        generate_proof(&leaves, index)
    }

    fn read_root(&self) -> Result<Option<String>> {
        let bytes = read_optional(&self.root_path, "Failed to read Merkle root")?;
        let root = String::from_utf8_lossy(&bytes).trim().to_string();
        Ok(if root.is_empty() { None } else { Some(root) })
    }

    /// Replace the root file via a temporary file and rename.
    fn write_root(&self, root: &str) -> Result<()> {
        let tmp_path = temp_path(&self.root_path);
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(root.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.root_path)?;
            sync_parent(&self.root_path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            AuditError::io(
                format!("Failed to write Merkle root to {}", self.root_path.display()),
                e,
            )
        })
    }

    fn write_record(&self, record: &[u8]) -> Result<()> {
        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            file.write_all(record)?;
            file.sync_data()
        };

        write().map_err(|e| {
            AuditError::io(
                format!("Failed to append to audit log {}", self.log_path.display()),
                e,
            )
        })
    }

    fn rollback(&self, previous_root: Option<&str>, previous_len: u64) {
        let restored = match previous_root {
            Some(root) => self.write_root(root),
            None => match fs::remove_file(&self.root_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AuditError::io("Failed to remove Merkle root", e)),
            },
        };
        if let Err(e) = restored {
            error!("Audit rollback could not restore the previous root: {}", e);
        }

        let truncated = OpenOptions::new()
            .write(true)
            .open(&self.log_path)
            .and_then(|file| file.set_len(previous_len));
        match truncated {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!("Audit rollback could not truncate the log: {}", e),
        }
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    // The lock guards no data of its own, so a panicked holder leaves
    // nothing inconsistent behind it.
    /// Hold the write lock as a stalled writer would.
    #[cfg(test)]
    pub(crate) fn hold_write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.write_lock()
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read a file, treating a missing file as empty.
fn read_optional(path: &Path, context: &str) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(AuditError::io(format!("{} {}", context, path.display()), e)),
    }
}

/// Split the log into entries. Every line counts, blank ones included; the
/// final terminator does not start a new entry.
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    body.split(|b| *b == b'\n').collect()
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|e| AuditError::io(format!("Failed to create {}", parent.display()), e)),
        _ => Ok(()),
    }
}

/// Persist a rename by syncing the directory that holds `path`.
#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

// Directories cannot be opened as files here; the rename is as durable as
// the platform makes it.
#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
