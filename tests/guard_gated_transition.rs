//! Scenario 2 (spec §8), adapted to the pieces this crate exposes
//! directly: a transition guarded by `BundleApproved` is denied when a
//! required validator has not approved, and the QA entity's file and
//! history are left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use edison::error::EdisonError;
use edison::guard::register_standard_guards;
use edison::repository::FileRepository;
use edison_core::state_machine::{Registries, StateMachineRuntime, StateSpec, StateMachineSpec, TransitionSpec};
use edison_core::{EntityId, QaRecord};
use serde_json::{json, Map};
use tempfile::TempDir;

fn qa_runtime() -> Arc<StateMachineRuntime> {
    let mut registries = Registries::new();
    register_standard_guards(&mut registries);

    let mut states = HashMap::new();
    states.insert(
        "waiting".to_owned(),
        StateSpec {
            initial: true,
            is_final: false,
            allowed_transitions: vec![TransitionSpec {
                to: "todo".to_owned(),
                guard: Some("BundleApproved".to_owned()),
                conditions: vec![],
                actions: vec![],
            }],
        },
    );
    states.insert(
        "todo".to_owned(),
        StateSpec {
            initial: false,
            is_final: false,
            allowed_transitions: vec![],
        },
    );

    let mut runtime = StateMachineRuntime::new(registries);
    runtime.add_spec("qa", StateMachineSpec { states }).unwrap();
    Arc::new(runtime)
}

#[test]
fn promotion_is_denied_when_a_required_validator_has_not_approved() {
    let tmp = TempDir::new().unwrap();
    let repo = FileRepository::for_qa(
        tmp.path().to_owned(),
        tmp.path().join(".edison"),
        qa_runtime(),
        3,
        std::time::Duration::from_millis(500),
        false,
    );

    let qa = QaRecord::new(EntityId::new("T1").unwrap(), "waiting", chrono::Utc::now());
    repo.create(&qa).unwrap();

    let mut ctx = Map::new();
    ctx.insert("required_validators".to_owned(), json!(["security"]));
    ctx.insert("validator_verdicts".to_owned(), json!({}));
    ctx.insert("bundle_summary_present".to_owned(), json!(true));

    let err = repo.transition("T1-qa", "todo", ctx, None, None).unwrap_err();
    assert!(matches!(err, EdisonError::StateMachine(_)));

    let unchanged = repo.get("T1-qa").unwrap().unwrap();
    assert_eq!(unchanged.state, "waiting");
    assert!(unchanged.state_history.is_empty());
}

#[test]
fn promotion_succeeds_once_every_required_validator_approves() {
    let tmp = TempDir::new().unwrap();
    let repo = FileRepository::for_qa(
        tmp.path().to_owned(),
        tmp.path().join(".edison"),
        qa_runtime(),
        3,
        std::time::Duration::from_millis(500),
        false,
    );

    let qa = QaRecord::new(EntityId::new("T1").unwrap(), "waiting", chrono::Utc::now());
    repo.create(&qa).unwrap();

    let mut ctx = Map::new();
    ctx.insert("required_validators".to_owned(), json!(["security"]));
    ctx.insert("validator_verdicts".to_owned(), json!({"security": "approve"}));
    ctx.insert("bundle_summary_present".to_owned(), json!(true));

    let updated = repo.transition("T1-qa", "todo", ctx, None, None).unwrap();
    assert_eq!(updated.state, "todo");
    assert_eq!(updated.state_history.len(), 1);
}
