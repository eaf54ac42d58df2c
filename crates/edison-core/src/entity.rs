//! Shared entity core: identity, lifecycle state, metadata, and history.
//!
//! `BaseEntity` is embedded by `Task`, `QaRecord`, and `Session` so the
//! repository layer can validate and record transitions generically (I1-I3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// A single recorded state transition. History is append-only (I2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from_state: String,
    pub to_state: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Creation/update provenance shared by every entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Metadata {
    #[must_use]
    pub fn new(now: DateTime<Utc>, created_by: Option<String>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            created_by,
        }
    }
}

/// The fields common to every persisted entity kind.
///
/// Invariants upheld by construction + the repository layer, never by
/// callers mutating fields directly:
/// - I1: `state` is always a member of that entity kind's state machine.
/// - I2: `state_history` only grows, never shrinks or reorders.
/// - I3: `metadata.updated_at` is monotonic non-decreasing across transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntity {
    pub id: EntityId,
    pub state: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub state_history: Vec<HistoryEntry>,
}

impl BaseEntity {
    #[must_use]
    pub fn new(id: EntityId, initial_state: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: initial_state.into(),
            metadata: Metadata::new(now, None),
            state_history: Vec::new(),
        }
    }

    /// Record a transition already validated by the caller. Enforces I2/I3
    /// unconditionally: `updated_at` only moves forward, history only grows.
    pub fn record_transition(
        &mut self,
        to_state: impl Into<String>,
        now: DateTime<Utc>,
        actor: Option<String>,
    ) {
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
