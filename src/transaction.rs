//! Validation Transaction (C11): stage a bundle of validator artifacts
//! under `.tx/{nonce}/` and commit them into the real evidence tree
//! atomically, or discard them on abort — never a partial bundle visible
//! to readers of the committed tree.
//!
//! One uncommitted transaction per session is enforced via `.tx.lock`;
//! every commit/abort/recovery appends to `validation-transactions.log`,
//! and sweeping orphaned staging directories is idempotent.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fs2::available_space;
use serde::Serialize;
use thiserror::Error;

use crate::fileio::{acquire_file_lock, FileIoError, FileLockGuard};

const LOCK_POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("a validation transaction is already in progress for session '{session_id}'")]
    TransactionInProgress { session_id: String },
    #[error("out of space: required at least {required_bytes} free bytes at '{}'", path.display())]
    OutOfSpace { path: PathBuf, required_bytes: u64 },
    #[error("transaction already committed or aborted")]
    AlreadyClosed,
    #[error(transparent)]
    Io(#[from] FileIoError),
}

fn nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}-{:x}", std::process::id(), nanos)
}

#[derive(Serialize)]
struct LogEntry<'a> {
    tx_id: &'a str,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    committed_at: Option<DateTime<Utc>>,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

fn append_log(log_path: &Path, entry: &LogEntry<'_>) -> Result<(), TransactionError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).map_err(|source| FileIoError::Io {
            path: parent.to_owned(),
            source,
        })?;
    }
    let mut existing = fs::read_to_string(log_path).unwrap_or_default();
    existing.push_str(&serde_json::to_string(entry).expect("LogEntry always serializes"));
    existing.push('\n');
    fs::write(log_path, existing).map_err(|source| FileIoError::Io {
        path: log_path.to_owned(),
        source,
    })?;
    Ok(())
}

/// An open staging area for one session's validation bundle. Exactly one
/// may exist per session at a time (`.tx.lock` enforces this).
#[derive(Debug)]
pub struct ValidationTransaction {
    tx_id: String,
    started_at: DateTime<Utc>,
    staging_root: PathBuf,
    target_root: PathBuf,
    log_path: PathBuf,
    _lock: FileLockGuard,
    closed: bool,
}

impl ValidationTransaction {
    /// The directory the caller should write staged artifacts beneath,
    /// using paths relative to it that mirror the final evidence layout.
    #[must_use]
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Move every staged file into `target_root`, preferring a same-
    /// filesystem `rename` and falling back to copy+fsync+remove.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::AlreadyClosed);
        }
        move_tree(&self.staging_root, &self.target_root)?;
        let _ = fs::remove_dir_all(&self.staging_root);
        append_log(
            &self.log_path,
            &LogEntry {
                tx_id: &self.tx_id,
                started_at: self.started_at,
                committed_at: Some(Utc::now()),
                status: "commit",
                reason: None,
            },
        )?;
        self.closed = true;
        Ok(())
    }

    /// Discard the staged tree without committing.
    pub fn abort(mut self, reason: &str) -> Result<(), TransactionError> {
        self.abort_inner(reason)
    }

    fn abort_inner(&mut self, reason: &str) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::AlreadyClosed);
        }
        let _ = fs::remove_dir_all(&self.staging_root);
        append_log(
            &self.log_path,
            &LogEntry {
                tx_id: &self.tx_id,
                started_at: self.started_at,
                committed_at: None,
                status: "abort",
                reason: Some(reason),
            },
        )?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for ValidationTransaction {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.abort_inner("dropped without commit");
        }
    }
}

fn move_tree(src: &Path, dst: &Path) -> Result<(), TransactionError> {
    if !src.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            TransactionError::Io(FileIoError::Io {
                path: src.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).expect("walked entries are under src");
        let dest_path = dst.join(rel);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|source| FileIoError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }
        if fs::rename(entry.path(), &dest_path).is_err() {
            fs::copy(entry.path(), &dest_path).map_err(|source| FileIoError::Io {
                path: dest_path.clone(),
                source,
            })?;
            fs::remove_file(entry.path()).map_err(|source| FileIoError::Io {
                path: entry.path().to_owned(),
                source,
            })?;
        }
    }
    Ok(())
}

const MIN_FREE_BYTES_DEFAULT: u64 = 10 * 1024 * 1024;

/// Open a staging transaction for `session_id`. `target_root` is where
/// staged artifacts land on commit (typically the management directory).
/// Fails fast with `TransactionInProgress` if another transaction already
/// holds the session's lock, and with `OutOfSpace` if free space on the
/// staging filesystem is below `min_free_bytes`.
pub fn validation_transaction(
    sessions_root: &Path,
    target_root: &Path,
    session_id: &str,
    min_free_bytes: Option<u64>,
) -> Result<ValidationTransaction, TransactionError> {
    let session_dir = sessions_root.join(session_id);
    fs::create_dir_all(&session_dir).map_err(|source| FileIoError::Io {
        path: session_dir.clone(),
        source,
    })?;

    let lock_path = session_dir.join(".tx.lock");
    let lock = acquire_file_lock(&lock_path, LOCK_POLL_TIMEOUT, false).map_err(|err| match err {
        FileIoError::LockTimeout { .. } => TransactionError::TransactionInProgress {
            session_id: session_id.to_owned(),
        },
        other => TransactionError::Io(other),
    })?;

    let required = min_free_bytes.unwrap_or(MIN_FREE_BYTES_DEFAULT);
    if let Ok(free) = available_space(&session_dir) {
        if free < required {
            return Err(TransactionError::OutOfSpace {
                path: session_dir,
                required_bytes: required,
            });
        }
    }

    let tx_id = nonce();
    let staging_root = session_dir.join(".tx").join(&tx_id);
    fs::create_dir_all(&staging_root).map_err(|source| FileIoError::Io {
        path: staging_root.clone(),
        source,
    })?;

    Ok(ValidationTransaction {
        tx_id,
        started_at: Utc::now(),
        staging_root,
        target_root: target_root.to_owned(),
        log_path: session_dir.join("validation-transactions.log"),
        _lock: lock,
        closed: false,
    })
}

/// Delete orphaned `.tx/{nonce}` staging directories left behind by a
/// crash (no process holds the session lock, so nothing is actively
/// writing them). Idempotent: a clean tree recovers zero.
pub fn recover_incomplete_validation_transactions(
    sessions_root: &Path,
    session_id: &str,
) -> Result<u32, TransactionError> {
    let session_dir = sessions_root.join(session_id);
    let lock_path = session_dir.join(".tx.lock");

    let lock = match acquire_file_lock(&lock_path, Duration::from_millis(1), false) {
        Ok(guard) => guard,
        Err(FileIoError::LockTimeout { .. }) => return Ok(0),
        Err(other) => return Err(TransactionError::Io(other)),
    };

    let tx_parent = session_dir.join(".tx");
    let mut recovered = 0u32;
    if tx_parent.exists() {
        for entry in fs::read_dir(&tx_parent).map_err(|source| FileIoError::Io {
            path: tx_parent.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| FileIoError::Io {
                path: tx_parent.clone(),
                source,
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let _ = fs::remove_dir_all(entry.path());
                append_log(
                    &session_dir.join("validation-transactions.log"),
                    &LogEntry {
                        tx_id: &entry.file_name().to_string_lossy(),
                        started_at: Utc::now(),
                        committed_at: None,
                        status: "recovered",
                        reason: Some("orphaned staging directory from an unclean exit"),
                    },
                )?;
                recovered += 1;
            }
        }
    }
    drop(lock);
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn commit_moves_staged_files_into_target_root() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        let target_root = tmp.path().join("project");
        let tx = validation_transaction(&sessions_root, &target_root, "sid-1", Some(0)).unwrap();
        let staged = tx.staging_root().join("qa/validation-evidence/task-1/round-1");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("implementation-report.json"), "{}").unwrap();
        tx.commit().unwrap();

        let committed = target_root.join("qa/validation-evidence/task-1/round-1/implementation-report.json");
        assert!(committed.exists());

        let log = fs::read_to_string(sessions_root.join("sid-1/validation-transactions.log")).unwrap();
        assert!(log.contains("commit"));
        assert!(log.contains("started_at"));
    }

    #[test]
    fn abort_leaves_no_trace_in_target_root() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        let target_root = tmp.path().join("project");
        let tx = validation_transaction(&sessions_root, &target_root, "sid-2", Some(0)).unwrap();
        let staged = tx.staging_root().join("qa/validation-evidence/task-2/round-1");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("report.json"), "{}").unwrap();
        tx.abort("test rollback").unwrap();

        assert!(!target_root.join("qa/validation-evidence/task-2").exists());
    }

    #[test]
    fn implicit_drop_aborts_without_commit() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        let target_root = tmp.path().join("project");
        {
            let tx = validation_transaction(&sessions_root, &target_root, "sid-3", Some(0)).unwrap();
            fs::create_dir_all(tx.staging_root()).unwrap();
            fs::write(tx.staging_root().join("marker"), "x").unwrap();
        }
        assert!(!target_root.exists());
    }

    #[test]
    fn second_transaction_fails_fast_while_first_is_open() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        let target_root = tmp.path().join("project");
        let tx1 = validation_transaction(&sessions_root, &target_root, "sid-4", Some(0)).unwrap();
        let err = validation_transaction(&sessions_root, &target_root, "sid-4", Some(0)).unwrap_err();
        assert!(matches!(err, TransactionError::TransactionInProgress { .. }));
        tx1.abort("cleanup").unwrap();
    }

    #[test]
    fn recovery_is_idempotent_on_a_clean_tree() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        fs::create_dir_all(sessions_root.join("sid-5")).unwrap();
        let first = recover_incomplete_validation_transactions(&sessions_root, "sid-5").unwrap();
        let second = recover_incomplete_validation_transactions(&sessions_root, "sid-5").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[test]
    fn recovery_removes_orphaned_staging_directories() {
        let tmp = TempDir::new().unwrap();
        let sessions_root = tmp.path().join("sessions");
        let orphan = sessions_root.join("sid-6/.tx/orphan-nonce");
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("marker"), "x").unwrap();

        let recovered = recover_incomplete_validation_transactions(&sessions_root, "sid-6").unwrap();
        assert_eq!(recovered, 1);
        assert!(!orphan.exists());

        let second = recover_incomplete_validation_transactions(&sessions_root, "sid-6").unwrap();
        assert_eq!(second, 0);
    }
}
