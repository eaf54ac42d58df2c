//! File IO & Locking (C2): atomic writes and advisory per-path locks.
//!
//! Writes go to a temp file in the same directory, `fsync`, then `rename`,
//! so a reader never observes a partial write. Cross-process exclusivity
//! is advisory locking via `fs2`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use thiserror::Error;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum FileIoError {
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock on '{}' not acquired within the configured timeout", path.display())]
    LockTimeout { path: PathBuf },
}

fn io_err(path: &Path, source: std::io::Error) -> FileIoError {
    FileIoError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Create `{path}.tmp-{nonce}` in the same directory as `path`, write
/// `content`, `fsync`, then atomically rename into place. Never leaves a
/// partial file observable at `path`. Parents are created on demand.
///
/// # Errors
/// Returns [`FileIoError::Io`] on any filesystem failure; the temp file is
/// left orphaned rather than swapped in, so `path` itself is untouched.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), FileIoError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let nonce = write_nonce();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!("{file_name}.tmp-{nonce}"));

    let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
    file.write_all(content).map_err(|e| io_err(&tmp_path, e))?;
    file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))
}

fn write_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{:x}-{:x}", std::process::id(), nanos)
}

/// A held advisory lock on `{path}.lock`. Dropping releases it.
///
/// When `bypassed` is true (only possible via `fail_open`), no lock is
/// actually held — the caller proceeds best-effort after the configured
/// timeout elapsed.
#[derive(Debug)]
pub struct FileLockGuard {
    _file: Option<File>,
    pub bypassed: bool,
}

/// Acquire an advisory exclusive lock on `{path}.lock`, polling at
/// `DEFAULT_POLL_INTERVAL` until `timeout` elapses.
///
/// If the timeout elapses and `fail_open` is true, returns a sentinel guard
/// (`bypassed = true`) that lets the caller proceed without the lock.
/// Otherwise returns [`FileIoError::LockTimeout`].
///
/// # Errors
/// Returns [`FileIoError::Io`] if the lock file cannot be created, or
/// [`FileIoError::LockTimeout`] per the above.
pub fn acquire_file_lock(path: &Path, timeout: Duration, fail_open: bool) -> Result<FileLockGuard, FileIoError> {
    let lock_path = lock_path_for(path);
    if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| io_err(&lock_path, e))?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(FileLockGuard {
                    _file: Some(file),
                    bypassed: false,
                });
            }
            Err(_) if Instant::now() >= deadline => {
                return if fail_open {
                    Ok(FileLockGuard {
                        _file: None,
                        bypassed: true,
                    })
                } else {
                    Err(FileIoError::LockTimeout { path: path.to_owned() })
                };
            }
            Err(_) => thread::sleep(DEFAULT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))),
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    name.push_str(".lock");
    path.with_file_name(name)
}

/// The intended persistence primitive: acquire the per-path lock, then
/// `atomic_write` inside it.
///
/// # Errors
/// Propagates [`acquire_file_lock`] and [`atomic_write`] failures.
pub fn write_text_locked(path: &Path, content: &str, timeout: Duration, fail_open: bool) -> Result<(), FileIoError> {
    let _guard = acquire_file_lock(path, timeout, fail_open)?;
    atomic_write(path, content.as_bytes())
}

/// Read a file's full text content.
///
/// # Errors
/// Returns [`FileIoError::Io`] on any filesystem failure.
pub fn read_text(path: &Path) -> Result<String, FileIoError> {
    fs::read_to_string(path).map_err(|e| io_err(path, e))
}
