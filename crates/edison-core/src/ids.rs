//! Validated entity identifiers.
//!
//! IDs are rejected before any filesystem operation is attempted (P9):
//! character class `[A-Za-z0-9._-]`, no leading dash, no path separators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A validated entity identifier shared by Task, QA, and Session ids.
///
/// Matches `^[A-Za-z0-9][A-Za-z0-9._-]*$` — no leading `-`, no `/`, no `\`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

/// Why an id failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidId {
    /// The offending input, quoted back to the caller.
    pub value: String,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid id '{}': {}", self.value, self.reason)
    }
}

impl std::error::Error for InvalidId {}

impl EntityId {
    /// Validate and construct an `EntityId`.
    ///
    /// # Errors
    /// Returns [`InvalidId`] if `s` is empty, contains a path separator,
    /// `..`, starts with `-`, or contains a character outside
    /// `[A-Za-z0-9._-]`.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        Self::validate(&s)?;
        Ok(Self(s))
    }

    fn validate(s: &str) -> Result<(), InvalidId> {
        if s.is_empty() {
            return Err(InvalidId {
                value: s.to_owned(),
                reason: "id must not be empty".to_owned(),
            });
        }
        if s.starts_with('-') {
            return Err(InvalidId {
                value: s.to_owned(),
                reason: "id must not start with '-'".to_owned(),
            });
        }
        if s.contains('/') || s.contains('\\') {
            return Err(InvalidId {
                value: s.to_owned(),
                reason: "id must not contain a path separator".to_owned(),
            });
        }
        if s.contains("..") {
            return Err(InvalidId {
                value: s.to_owned(),
                reason: "id must not contain '..'".to_owned(),
            });
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(InvalidId {
                value: s.to_owned(),
                reason: format!("id contains disallowed character '{bad}'"),
            });
        }
        Ok(())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The QA id convention for a task id: `"{task_id}-qa"`.
    #[must_use]
    pub fn qa_id_for_task(&self) -> Self {
        Self(format!("{}-qa", self.0))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = InvalidId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
