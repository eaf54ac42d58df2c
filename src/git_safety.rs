//! Git subprocess safety and repo fingerprinting (§6.6).
//!
//! Every invocation that embeds a caller-supplied identifier (a ref name, a
//! path, a task id used as a branch name) inserts `--` ahead of the
//! positional arguments: `args()` + `current_dir()` + `output()`, non-zero
//! exit turned into a typed error carrying the command and trimmed stderr.

use std::path::Path;
use std::process::Command;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitSafetyError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {command} failed (exit {exit_code:?}): {stderr}")]
    GitCommand {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },
}

/// Run `git <subcommand> -- <positional_args>` in `root`, where
/// `positional_args` may contain caller-supplied identifiers. The `--`
/// separator prevents an identifier starting with `-` from being parsed as
/// a flag (argument injection).
pub fn run_git_with_separator(
    root: &Path,
    subcommand: &[&str],
    positional_args: &[&str],
) -> Result<String, GitSafetyError> {
    let mut args: Vec<&str> = subcommand.to_vec();
    args.push("--");
    args.extend_from_slice(positional_args);

    let output = Command::new("git").args(&args).current_dir(root).output()?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
    }

    Err(GitSafetyError::GitCommand {
        command: format!("git {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        exit_code: output.status.code(),
    })
}

/// `(head_sha_or_unknown, sha256_of_index_bytes, dirty_bit)` — the fields
/// the Evidence Service's snapshot key is built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoFingerprint {
    pub head: String,
    pub index_sha256: String,
    pub dirty: bool,
}

impl RepoFingerprint {
    #[must_use]
    pub fn dirty_bit(&self) -> &'static str {
        if self.dirty {
            "dirty"
        } else {
            "clean"
        }
    }
}

/// Compute the repo fingerprint used to key command-evidence snapshots.
/// `root` need not be a git repository: a missing HEAD yields
/// `"unknown-head"`, a missing/unreadable index hashes as empty bytes, and
/// the dirty bit defaults to `clean`.
#[must_use]
pub fn compute_repo_fingerprint(root: &Path) -> RepoFingerprint {
    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(root)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-head".to_owned());

    let index_bytes = std::fs::read(root.join(".git").join("index")).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&index_bytes);
    let index_sha256 = format!("{:x}", hasher.finalize());

    let dirty = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(root)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .is_some_and(|o| !o.stdout.is_empty());

    RepoFingerprint {
        head,
        index_sha256,
        dirty,
    }
}
