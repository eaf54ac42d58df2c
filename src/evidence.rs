//! Evidence Service (C10): persist and query evidence for a task's
//! validation rounds, and for repo-state command-output snapshots shared
//! across tasks.
//!
//! Layout grounded in §6.1/§6.4:
//! ```text
//! qa/validation-evidence/{task_id}/round-{n}/
//!   implementation-report.json
//!   validator-{id}-report.json
//!   bundle-approved.md
//! qa/snapshots/{HEAD}/{index_sha}/{dirty_bit}/
//!   command-{name}.txt
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

use crate::fileio::{read_text, write_text_locked, FileIoError};
use crate::git_safety::RepoFingerprint;

type HmacSha256 = Hmac<Sha256>;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error(transparent)]
    Io(#[from] FileIoError),
    #[error("evidence payload missing required field '{0}'")]
    MissingField(&'static str),
    #[error("HMAC key must not be empty")]
    EmptyHmacKey,
}

/// Where a task's validation evidence lives, anchored at the management
/// directory (`.project/` in the default layout).
pub struct EvidenceService {
    management_dir: PathBuf,
    required_round_files: Vec<String>,
}

impl EvidenceService {
    #[must_use]
    pub fn new(management_dir: impl Into<PathBuf>) -> Self {
        Self {
            management_dir: management_dir.into(),
            required_round_files: vec!["implementation-report.json".to_owned()],
        }
    }

    #[must_use]
    pub fn with_required_round_files(mut self, files: Vec<String>) -> Self {
        self.required_round_files = files;
        self
    }

    fn task_root(&self, task_id: &str) -> PathBuf {
        self.management_dir
            .join("qa")
            .join("validation-evidence")
            .join(task_id)
    }

    fn round_dir(&self, task_id: &str, round: u32) -> PathBuf {
        self.task_root(task_id).join(format!("round-{round}"))
    }

    /// Create `round-{n}`'s directory if absent, returning its path.
    pub fn ensure_round(&self, task_id: &str, round: u32) -> Result<PathBuf, EvidenceError> {
        let dir = self.round_dir(task_id, round);
        std::fs::create_dir_all(&dir).map_err(|source| FileIoError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// The highest existing round number for `task_id`, or `None` if no
    /// rounds exist yet. Rounds are 1-indexed.
    #[must_use]
    pub fn get_latest_round(&self, task_id: &str) -> Option<u32> {
        let root = self.task_root(task_id);
        std::fs::read_dir(&root)
            .ok()?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_round_dir_name))
            .max()
    }

    /// The snapshot directory for a repo fingerprint.
    #[must_use]
    pub fn snapshot_dir(&self, fingerprint: &RepoFingerprint) -> PathBuf {
        self.management_dir
            .join("qa")
            .join("snapshots")
            .join(&fingerprint.head)
            .join(&fingerprint.index_sha256)
            .join(fingerprint.dirty_bit())
    }

    /// Write a structured command-evidence record. Appends an HMAC over
    /// the canonicalized header when `hmac_key` is supplied.
    pub fn write_command_evidence(
        &self,
        path: &Path,
        evidence: &CommandEvidence,
        hmac_key: Option<&[u8]>,
    ) -> Result<(), EvidenceError> {
        let mut header = evidence.render_header();
        if let Some(key) = hmac_key {
            let mac_hex = compute_hmac(key, &header)?;
            header.push_str(&format!("hmac: {mac_hex}\n"));
        }
        let body = format!("{header}---\n{}", evidence.output);
        write_text_locked(path, &body, LOCK_TIMEOUT, false)?;
        Ok(())
    }

    /// Write `implementation-report.json`, enforcing required fields.
    pub fn write_implementation_report(
        &self,
        task_id: &str,
        round: u32,
        payload: &Map<String, Value>,
    ) -> Result<PathBuf, EvidenceError> {
        require_field(payload, "taskId")?;
        require_field(payload, "round")?;
        let dir = self.ensure_round(task_id, round)?;
        let path = dir.join("implementation-report.json");
        let text = serde_json::to_string_pretty(payload).expect("Map<String, Value> always serializes");
        write_text_locked(&path, &text, LOCK_TIMEOUT, false)?;
        Ok(path)
    }

    /// Write `validator-{id}-report.json`, enforcing required fields.
    pub fn write_validator_report(
        &self,
        task_id: &str,
        round: u32,
        validator_id: &str,
        payload: &Map<String, Value>,
    ) -> Result<PathBuf, EvidenceError> {
        require_field(payload, "taskId")?;
        require_field(payload, "round")?;
        require_field(payload, "validatorId")?;
        require_field(payload, "verdict")?;
        let dir = self.ensure_round(task_id, round)?;
        let path = dir.join(format!("validator-{validator_id}-report.json"));
        let text = serde_json::to_string_pretty(payload).expect("Map<String, Value> always serializes");
        write_text_locked(&path, &text, LOCK_TIMEOUT, false)?;
        Ok(path)
    }

    /// Evidence files required by `self.required_round_files` that are
    /// missing from the latest round.
    #[must_use]
    pub fn missing_evidence_blockers(&self, task_id: &str) -> Vec<String> {
        let Some(round) = self.get_latest_round(task_id) else {
            return self.required_round_files.clone();
        };
        let dir = self.round_dir(task_id, round);
        self.required_round_files
            .iter()
            .filter(|file| !dir.join(file).exists())
            .cloned()
            .collect()
    }
}

fn parse_round_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("round-")?.parse().ok()
}

fn require_field(payload: &Map<String, Value>, field: &'static str) -> Result<(), EvidenceError> {
    if payload.contains_key(field) {
        Ok(())
    } else {
        Err(EvidenceError::MissingField(field))
    }
}

/// A single captured command's evidence, per §6.4's header schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEvidence {
    pub task_id: String,
    pub round: u32,
    pub command_name: String,
    pub command: String,
    pub cwd: String,
    pub exit_code: i32,
    pub output: String,
    pub fingerprint: RepoFingerprintRecord,
}

/// Serializable mirror of [`RepoFingerprint`] for embedding in evidence
/// headers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoFingerprintRecord {
    pub head: String,
    pub index_sha256: String,
    pub dirty: bool,
}

impl From<&RepoFingerprint> for RepoFingerprintRecord {
    fn from(fp: &RepoFingerprint) -> Self {
        Self {
            head: fp.head.clone(),
            index_sha256: fp.index_sha256.clone(),
            dirty: fp.dirty,
        }
    }
}

impl CommandEvidence {
    fn render_header(&self) -> String {
        format!(
            "taskId: {}\nround: {}\ncommandName: {}\ncommand: {}\ncwd: {}\nexitCode: {}\ncapturedAt: {}\nfingerprint: {}|{}|{}\n",
            self.task_id,
            self.round,
            self.command_name,
            self.command,
            self.cwd,
            self.exit_code,
            Utc::now().to_rfc3339(),
            self.fingerprint.head,
            self.fingerprint.index_sha256,
            if self.fingerprint.dirty { "dirty" } else { "clean" },
        )
    }
}

fn compute_hmac(key: &[u8], header: &str) -> Result<String, EvidenceError> {
    if key.is_empty() {
        return Err(EvidenceError::EmptyHmacKey);
    }
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(header.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Re-read a command evidence file and verify its trailing `hmac:` line
/// against the header that precedes it.
#[must_use]
pub fn verify_command_evidence_hmac(path: &Path, key: &[u8]) -> bool {
    let Ok(content) = read_text(path) else {
        return false;
    };
    let Some((header_with_hmac, _body)) = content.split_once("---\n") else {
        return false;
    };
    let Some(hmac_line_start) = header_with_hmac.rfind("hmac: ") else {
        return false;
    };
    let claimed = header_with_hmac[hmac_line_start + "hmac: ".len()..].trim();
    let header_without_hmac = &header_with_hmac[..hmac_line_start];
    matches!(compute_hmac(key, header_without_hmac), Ok(computed) if computed == claimed)
}
