//! Session entity (§3, §6.2): persisted whole as `session.json`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::EntityId;

#[derive(Debug, Error)]
pub enum SessionCodecError {
    #[error("failed to parse session JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionGit {
    #[serde(default, rename = "worktreePath", skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(rename = "sessionId")]
    pub session_id: EntityId,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActive")]
    pub last_active: DateTime<Utc>,
    pub status: String,
    #[serde(default, rename = "orchestratorProfile", skip_serializing_if = "Option::is_none")]
    pub orchestrator_profile: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A Session's view of one scoped Task or QA record. The persisted shape is
/// open-ended (the entity's own file is the source of truth); Session keeps
/// only a denormalized pointer.
pub type SessionEntryMap = HashMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: EntityId,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(rename = "worktreeBase")]
    pub worktree_base: String,
    #[serde(default, rename = "parentTaskId", skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<EntityId>,
    pub meta: SessionMeta,
    #[serde(default)]
    pub git: SessionGit,
    #[serde(default)]
    pub tasks: SessionEntryMap,
    #[serde(default)]
    pub qa: SessionEntryMap,
    #[serde(default)]
    pub state_history: Vec<SessionHistoryEntry>,
    #[serde(default, rename = "activityLog")]
    pub activity_log: Vec<ActivityLogEntry>,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl Session {
    #[must_use]
    pub fn new(id: EntityId, initial_state: impl Into<String>, worktree_base: impl Into<String>, now: DateTime<Utc>) -> Self {
        let initial_state = initial_state.into();
        Self {
            meta: SessionMeta {
                session_id: id.clone(),
                created_at: now,
                last_active: now,
                status: initial_state.clone(),
                orchestrator_profile: None,
            },
            id,
            state: initial_state,
            owner: None,
            worktree_base: worktree_base.into(),
            parent_task_id: None,
            git: SessionGit {
                worktree_path: None,
                branch: None,
            },
            tasks: HashMap::new(),
            qa: HashMap::new(),
            state_history: Vec::new(),
            activity_log: Vec::new(),
            ready: true,
        }
    }

    pub fn decode(text: &str) -> Result<Self, SessionCodecError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, SessionCodecError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn record_transition(&mut self, to_state: impl Into<String>, now: DateTime<Utc>, reason: Option<String>) {
        let to_state = to_state.into();
        self.state_history.push(SessionHistoryEntry {
            from: self.state.clone(),
            to: to_state.clone(),
            timestamp: now,
            reason,
        });
        self.state = to_state.clone();
        self.meta.status = to_state;
        if now > self.meta.last_active {
            self.meta.last_active = now;
        }
    }

    pub fn log_activity(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.activity_log.push(ActivityLogEntry {
            timestamp: now,
            message: message.into(),
        });
        if now > self.meta.last_active {
            self.meta.last_active = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session::new(
            EntityId::new("s1").unwrap(),
            "active",
            "/repo/.worktrees/s1",
            Utc::now(),
        )
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let session = sample();
        let encoded = session.encode().unwrap();
        let decoded = Session::decode(&encoded).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn parses_the_documented_minimal_shape() {
        let json = r#"{
            "id": "s1",
            "state": "wip",
            "worktreeBase": "/repo/.worktrees/s1",
            "meta": {
                "sessionId": "s1",
                "createdAt": "2026-01-01T00:00:00Z",
                "lastActive": "2026-01-01T00:00:00Z",
                "status": "wip",
                "orchestratorProfile": "claude"
            },
            "git": {"worktreePath": null, "branch": "session/s1"},
            "tasks": {},
            "qa": {},
            "state_history": [{"from": "active", "to": "wip", "timestamp": "2026-01-01T00:00:01Z"}],
            "activityLog": [{"timestamp": "2026-01-01T00:00:01Z", "message": "claimed"}],
            "ready": true
        }"#;
        let session = Session::decode(json).unwrap();
        assert_eq!(session.git.branch.as_deref(), Some("session/s1"));
        assert_eq!(session.meta.orchestrator_profile.as_deref(), Some("claude"));
        assert_eq!(session.state_history.len(), 1);
    }

    #[test]
    fn transition_appends_history_and_syncs_status() {
        let mut session = sample();
        let later = session.meta.last_active + chrono::Duration::seconds(30);
        session.record_transition("closing", later, Some("all tasks done".to_owned()));
        assert_eq!(session.state, "closing");
        assert_eq!(session.meta.status, "closing");
        assert_eq!(session.state_history.len(), 1);
        assert_eq!(session.meta.last_active, later);
    }
}
