//! Append-only audit trail (§6.3): one JSON object per line under
//! `logs/state-transitions.jsonl`, appended by every Repository
//! `transition` after the new entity file has been persisted.

use std::path::{Path, PathBuf};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fileio::{write_text_locked, FileIoError};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub entity_kind: String,
    pub entity_id: String,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Appends JSON-lines audit records under `{management_dir}/logs/state-transitions.jsonl`.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    #[must_use]
    pub fn new(management_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: management_dir.into().join("logs").join("state-transitions.jsonl"),
        }
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), FileIoError> {
        let line = serde_json::to_string(record).expect("AuditRecord always serializes");
        append_line_locked(&self.path, &line)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_line_locked(path: &Path, line: &str) -> Result<(), FileIoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| FileIoError::Io {
            path: parent.to_owned(),
            source,
        })?;
    }
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut updated = existing;
    updated.push_str(line);
    updated.push('\n');
    write_text_locked(path, &updated, LOCK_TIMEOUT, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(entity_id: &str) -> AuditRecord {
        AuditRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            session_id: None,
            entity_kind: "task".to_owned(),
            entity_id: entity_id.to_owned(),
            from: "todo".to_owned(),
            to: "wip".to_owned(),
            reason: None,
            actor: None,
        }
    }

    #[test]
    fn appends_one_json_object_per_line() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path());
        log.append(&sample("task-1")).unwrap();
        log.append(&sample("task-2")).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["entityKind"], "task");
        }
    }

    #[test]
    fn omits_optional_fields_when_absent() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path());
        log.append(&sample("task-1")).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(!content.contains("sessionId"));
        assert!(!content.contains("reason"));
    }

    #[test]
    fn creates_parent_directories_on_first_append() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().join("nested"));
        log.append(&sample("task-1")).unwrap();
        assert!(log.path().exists());
    }
}
