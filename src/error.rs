//! Top-level error taxonomy (§7).
//!
//! Each component owns a `thiserror` enum for its own failure modes;
//! [`EdisonError`] aggregates them with `#[from]` so callers threading a
//! `Result<T, EdisonError>` through the Repository/Composition/Evidence
//! layers never have to hand-wrap a component error.

use std::path::PathBuf;

use edison_core::state_machine::StateMachineError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::fileio::FileIoError;
use crate::template::TemplateError;
use crate::transaction::TransactionError;

/// The unified error type surfaced at every public Edison API boundary.
#[derive(Debug, Error)]
pub enum EdisonError {
    /// Ill-formed id, invalid state value, invalid config key.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("entity not found: {kind} '{id}'")]
    EntityNotFound { kind: String, id: String },

    #[error("entity already exists: {kind} '{id}'")]
    EntityAlreadyExists { kind: String, id: String },

    #[error("transition from '{from}' to '{to}' refused: {reason}")]
    EntityStateError {
        from: String,
        to: String,
        reason: String,
    },

    #[error("guard '{guard}' denied: {message}")]
    GuardDenied { guard: String, message: String },

    #[error("condition '{condition}' failed: {message}")]
    ConditionFailed { condition: String, message: String },

    #[error("concurrent modification: retry budget exhausted after {attempts} attempt(s)")]
    ConcurrentModification { attempts: u32 },

    #[error("lock on '{}' not acquired within the configured timeout", path.display())]
    LockTimeout { path: PathBuf },

    #[error("I/O failure: {0}")]
    IoFailure(#[from] FileIoError),

    #[error("out of space: required at least {required_bytes} free bytes at '{}'", path.display())]
    OutOfSpace { path: PathBuf, required_bytes: u64 },

    #[error("a validation transaction is already in progress for session '{session_id}'")]
    TransactionInProgress { session_id: String },

    #[error("shadowing: layer '{layer}' redefines id '{id}' already provided by an earlier layer")]
    Shadowing { layer: String, id: String },

    #[error("dangling overlay: layer '{layer}' overlays id '{id}' with no earlier base definition")]
    DanglingOverlay { layer: String, id: String },

    #[error("composition error: {0}")]
    Composition(String),

    #[error("anchor not found: {0}")]
    AnchorNotFound(String),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl EdisonError {
    /// The stable machine identifier carried in `--json` error output (§7).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::EntityAlreadyExists { .. } => "entity_already_exists",
            Self::EntityStateError { .. } => "entity_state_error",
            Self::GuardDenied { .. } => "guard_denied",
            Self::ConditionFailed { .. } => "condition_failed",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::IoFailure(_) => "io_failure",
            Self::OutOfSpace { .. } => "out_of_space",
            Self::TransactionInProgress { .. } => "transaction_in_progress",
            Self::Shadowing { .. } => "shadowing",
            Self::DanglingOverlay { .. } => "dangling_overlay",
            Self::Composition(_) => "composition_error",
            Self::AnchorNotFound(_) => "anchor_not_found",
            Self::StateMachine(_) => "state_machine_error",
            Self::Config(_) => "config_error",
            Self::Discovery(_) => "discovery_error",
            Self::Transaction(_) => "transaction_error",
            Self::Template(_) => "template_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_for_entity_not_found() {
        let err = EdisonError::EntityNotFound {
            kind: "task".to_owned(),
            id: "T1".to_owned(),
        };
        assert_eq!(err.code(), "entity_not_found");
        assert!(format!("{err}").contains("T1"));
    }

    #[test]
    fn code_is_stable_for_guard_denied() {
        let err = EdisonError::GuardDenied {
            guard: "AllTasksReady".to_owned(),
            message: "task T2 still in wip".to_owned(),
        };
        assert_eq!(err.code(), "guard_denied");
    }
}
