//! Task entity (§3, §6.2): Markdown with YAML frontmatter, body preserved verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{HistoryEntry, Metadata};
use crate::frontmatter::{self, FrontmatterError};
use crate::ids::EntityId;

/// A Task's frontmatter, mirroring the on-disk shape in §6.2 exactly so the
/// round-trip law (`decode(encode(e)) == e`, P4) holds field-for-field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub child_ids: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<String>,
    pub metadata: Metadata,
    #[serde(default)]
    pub state_history: Vec<HistoryEntry>,

    /// The Markdown body, preserved verbatim on save (not part of the YAML
    /// frontmatter block).
    #[serde(skip)]
    pub body: String,
}

impl Task {
    #[must_use]
    pub fn new(id: EntityId, title: impl Into<String>, initial_state: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            wave: None,
            task_type: None,
            owner: None,
            state: initial_state.into(),
            parent_id: None,
            child_ids: Vec::new(),
            session_id: None,
            claimed_at: None,
            last_active: None,
            continuation_id: None,
            priority: None,
            estimated_effort: None,
            metadata: Metadata::new(now, None),
            state_history: Vec::new(),
            body: String::new(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrontmatterError> {
        let (mut task, body): (Task, String) = frontmatter::parse(text)?;
        task.body = body;
        Ok(task)
    }

    pub fn encode(&self) -> Result<String, FrontmatterError> {
        frontmatter::render(self, &self.body)
    }

    pub fn record_transition(&mut self, to_state: impl Into<String>, now: DateTime<Utc>, actor: Option<String>) {
        let to_state = to_state.into();
        self.state_history.push(HistoryEntry {
            from_state: self.state.clone(),
            to_state: to_state.clone(),
            at: now,
            actor,
            note: None,
        });
        self.state = to_state;
        if now > self.metadata.updated_at {
            self.metadata.updated_at = now;
        }
    }
}
