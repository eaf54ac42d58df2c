//! QA record entity (§3, §6.2): same Markdown+frontmatter shape as Task.
//!
//! One QA record exists per Task; `id` follows the `"{task_id}-qa"`
//! convention (I4, [`EntityId::qa_id_for_task`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{HistoryEntry, Metadata};
use crate::frontmatter::{self, FrontmatterError};
use crate::ids::EntityId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QaRecord {
    pub id: EntityId,
    pub task_id: EntityId,
    pub state: String,
    #[serde(default)]
    pub validator_assignments: Vec<String>,
    #[serde(default)]
    pub current_round: u32,
    pub metadata: Metadata,
    #[serde(default)]
    pub state_history: Vec<HistoryEntry>,

    #[serde(skip)]
    pub body: String,
    /// Parsed from the `## Validators` body section on decode; not written
    /// back directly — the body text remains the source of truth on save.
    #[serde(skip)]
    pub validators: Vec<String>,
    /// Parsed from the `## Primary Files` body section on decode.
    #[serde(skip)]
    pub primary_files: Vec<String>,
}

impl QaRecord {
    #[must_use]
    pub fn new(task_id: EntityId, initial_state: impl Into<String>, now: DateTime<Utc>) -> Self {
        let id = task_id.qa_id_for_task();
        Self {
            id,
            task_id,
            state: initial_state.into(),
            validator_assignments: Vec::new(),
            current_round: 0,
            metadata: Metadata::new(now, None),
            state_history: Vec::new(),
            body: String::new(),
            validators: Vec::new(),
            primary_files: Vec::new(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrontmatterError> {
        let (mut qa, body): (QaRecord, String) = frontmatter::parse(text)?;
        qa.validators = parse_bullet_section(&body, "Validators");
        qa.primary_files = parse_bullet_section(&body, "Primary Files");
        qa.body = body;
        Ok(qa)
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

/// Collect `- item` bullet lines under a `## {heading}` Markdown heading,
/// stopping at the next `##` heading or end of body.
fn parse_bullet_section(body: &str, heading: &str) -> Vec<String> {
    let marker = format!("## {heading}");
    let mut items = Vec::new();
    let mut in_section = false;
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(&marker) {
            in_section = true;
            continue;
        }
        if in_section {
            if trimmed.starts_with("## ") {
                break;
            }
            if let Some(item) = trimmed.strip_prefix("- ") {
                items.push(item.trim().to_owned());
            } else if let Some(item) = trimmed.strip_prefix("* ") {
                items.push(item.trim().to_owned());
            }
        }
    }
    items
}
