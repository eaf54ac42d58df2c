//! Guard Evaluator (C12): the named guards the State Machine Runtime
//! references for Task/QA/Session transitions.
//!
//! A guard is a pure function of `(entity, session?, evidence_view,
//! config)`; here that data arrives pre-extracted into
//! `edison_core::state_machine::TransitionContext::vars` by the caller
//! (typically the Repository), keeping guards themselves free of any
//! filesystem or entity-model dependency — mirroring how
//! `state_machine.rs`'s own sample guard in its tests reads `ctx.get(...)`
//! rather than touching an entity directly.
//!
//! Every guard here is fail-closed: a missing or malformed input denies
//! with a message naming what was expected, never panics.

use glob::Pattern;
use serde_json::Value;

use edison_core::state_machine::{GuardResult, Registries, TransitionContext};

fn string_array(ctx: &TransitionContext, key: &str) -> Result<Vec<String>, String> {
    match ctx.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| format!("'{key}' must be an array of strings"))
            })
            .collect(),
        Some(_) => Err(format!("'{key}' must be an array of strings")),
        None => Err(format!("missing required context value '{key}'")),
    }
}

fn string_map(ctx: &TransitionContext, key: &str) -> Result<serde_json::Map<String, Value>, String> {
    match ctx.get(key) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(format!("'{key}' must be an object")),
        None => Err(format!("missing required context value '{key}'")),
    }
}

fn flag(ctx: &TransitionContext, key: &str) -> bool {
    ctx.is_truthy(key)
}

/// Every Task owned by the session (`task_states`) is already in one of the
/// configured terminal states (`terminal_states`) — gates a session's move
/// into its own terminal state.
#[must_use]
pub fn all_tasks_ready(ctx: &TransitionContext) -> GuardResult {
    let task_states = match string_array(ctx, "task_states") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };
    let terminal_states = match string_array(ctx, "terminal_states") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };

    let not_ready: Vec<&str> = task_states
        .iter()
        .filter(|s| !terminal_states.iter().any(|t| t == *s))
        .map(String::as_str)
        .collect();

    if not_ready.is_empty() {
        GuardResult::Allow
    } else {
        GuardResult::Deny(format!(
            "{} task(s) not yet in a terminal state ({})",
            not_ready.len(),
            not_ready.join(", ")
        ))
    }
}

/// Every glob in `required_evidence_patterns` resolves to at least one file
/// in `available_evidence_files` (the caller has already scoped the latter
/// to the latest round or current snapshot).
#[must_use]
pub fn evidence_present(ctx: &TransitionContext) -> GuardResult {
    let required = match string_array(ctx, "required_evidence_patterns") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };
    let available = match string_array(ctx, "available_evidence_files") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };

    let mut missing = Vec::new();
    for pattern_str in &required {
        let matched = match Pattern::new(pattern_str) {
            Ok(pattern) => available.iter().any(|f| pattern.matches(f)),
            Err(_) => available.iter().any(|f| f == pattern_str),
        };
        if !matched {
            missing.push(pattern_str.as_str());
        }
    }

    if missing.is_empty() {
        GuardResult::Allow
    } else {
        GuardResult::Deny(format!("missing required evidence: {}", missing.join(", ")))
    }
}

/// Every child Task (`child_states`) is `done` or `validated` — gates a
/// parent Task's move into `done`.
#[must_use]
pub fn children_ready(ctx: &TransitionContext) -> GuardResult {
    let child_states = match string_array(ctx, "child_states") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };

    let not_ready: Vec<&str> = child_states
        .iter()
        .filter(|s| s.as_str() != "done" && s.as_str() != "validated")
        .map(String::as_str)
        .collect();

    if not_ready.is_empty() {
        GuardResult::Allow
    } else {
        GuardResult::Deny(format!(
            "{} child task(s) not yet done or validated ({})",
            not_ready.len(),
            not_ready.join(", ")
        ))
    }
}

/// Approval is re-derived from the validator reports on demand: every
/// blocking validator in `required_validators` must have an entry in
/// `validator_verdicts` equal to `"approve"`. `bundle_summary_present`
/// alone never suffices, but its absence is still reported.
#[must_use]
pub fn bundle_approved(ctx: &TransitionContext) -> GuardResult {
    let required = match string_array(ctx, "required_validators") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };
    let verdicts = match string_map(ctx, "validator_verdicts") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };

    if !flag(ctx, "bundle_summary_present") {
        return GuardResult::Deny("no bundle summary present in the latest round".to_owned());
    }

    let mut unapproved = Vec::new();
    for validator in &required {
        let verdict = verdicts.get(validator).and_then(Value::as_str);
        if verdict != Some("approve") {
            unapproved.push(validator.as_str());
        }
    }

    if unapproved.is_empty() {
        GuardResult::Allow
    } else {
        GuardResult::Deny(format!(
            "validator report(s) missing or not approved: {}",
            unapproved.join(", ")
        ))
    }
}

/// If the most recent commit message (`commit_messages`, chronological,
/// oldest first) begins with `[REFACTOR]`, the one immediately before it
/// must begin with `[GREEN]`. Any commit not following that sequence does
/// not trigger the guard at all.
#[must_use]
pub fn tdd_refactor_follows_green(ctx: &TransitionContext) -> GuardResult {
    let commits = match string_array(ctx, "commit_messages") {
        Ok(v) => v,
        Err(message) => return GuardResult::Deny(message),
    };

    let Some(last) = commits.last() else {
        return GuardResult::Allow;
    };
    if !last.starts_with("[REFACTOR]") {
        return GuardResult::Allow;
    }

    let previous = commits.len().checked_sub(2).and_then(|i| commits.get(i));
    match previous {
        Some(message) if message.starts_with("[GREEN]") => GuardResult::Allow,
        _ => GuardResult::Deny(
            "a [REFACTOR] commit must be immediately preceded by a [GREEN] commit".to_owned(),
        ),
    }
}

/// Register the standard guard set under the names the State Machine
/// Runtime's declarative specs reference.
pub fn register_standard_guards(registries: &mut Registries) {
    registries.register_guard("AllTasksReady", all_tasks_ready);
    registries.register_guard("EvidencePresent", evidence_present);
    registries.register_guard("ChildrenReady", children_ready);
    registries.register_guard("BundleApproved", bundle_approved);
    registries.register_guard("TDDRefactorFollowsGreen", tdd_refactor_follows_green);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(vars: serde_json::Map<String, Value>) -> TransitionContext {
        let mut ctx = TransitionContext::new(chrono::Utc::now());
        ctx.vars = vars;
        ctx
    }

    fn map(pairs: Vec<(&str, Value)>) -> serde_json::Map<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    #[test]
    fn all_tasks_ready_allows_when_every_task_is_terminal() {
        let ctx = ctx_with(map(vec![
            ("task_states", json!(["done", "validated"])),
            ("terminal_states", json!(["done", "validated"])),
        ]));
        assert_eq!(all_tasks_ready(&ctx), GuardResult::Allow);
    }

    #[test]
    fn all_tasks_ready_denies_when_a_task_is_still_in_flight() {
        let ctx = ctx_with(map(vec![
            ("task_states", json!(["done", "wip"])),
            ("terminal_states", json!(["done"])),
        ]));
        assert!(matches!(all_tasks_ready(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn all_tasks_ready_fails_closed_on_missing_context() {
        let ctx = ctx_with(map(vec![]));
        assert!(matches!(all_tasks_ready(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn evidence_present_matches_glob_patterns() {
        let ctx = ctx_with(map(vec![
            ("required_evidence_patterns", json!(["round-*/implementation-report.json"])),
            ("available_evidence_files", json!(["round-1/implementation-report.json"])),
        ]));
        assert_eq!(evidence_present(&ctx), GuardResult::Allow);
    }

    #[test]
    fn evidence_present_denies_when_a_pattern_has_no_match() {
        let ctx = ctx_with(map(vec![
            ("required_evidence_patterns", json!(["round-*/bundle.json"])),
            ("available_evidence_files", json!(["round-1/implementation-report.json"])),
        ]));
        assert!(matches!(evidence_present(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn children_ready_accepts_done_and_validated() {
        let ctx = ctx_with(map(vec![("child_states", json!(["done", "validated"]))]));
        assert_eq!(children_ready(&ctx), GuardResult::Allow);
    }

    #[test]
    fn bundle_approved_requires_every_blocking_validator_to_approve() {
        let ctx = ctx_with(map(vec![
            ("required_validators", json!(["security", "style"])),
            ("validator_verdicts", json!({"security": "approve", "style": "approve"})),
            ("bundle_summary_present", json!(true)),
        ]));
        assert_eq!(bundle_approved(&ctx), GuardResult::Allow);
    }

    #[test]
    fn bundle_approved_denies_on_a_synthetic_approval_without_a_report() {
        let ctx = ctx_with(map(vec![
            ("required_validators", json!(["security", "style"])),
            ("validator_verdicts", json!({"security": "approve"})),
            ("bundle_summary_present", json!(true)),
        ]));
        assert!(matches!(bundle_approved(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn bundle_approved_denies_without_a_bundle_summary_even_if_all_approve() {
        let ctx = ctx_with(map(vec![
            ("required_validators", json!(["security"])),
            ("validator_verdicts", json!({"security": "approve"})),
            ("bundle_summary_present", json!(false)),
        ]));
        assert!(matches!(bundle_approved(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn tdd_refactor_follows_green_allows_a_matching_pair() {
        let ctx = ctx_with(map(vec![(
            "commit_messages",
            json!(["[RED] add failing test", "[GREEN] implement", "[REFACTOR] clean up"]),
        )]));
        assert_eq!(tdd_refactor_follows_green(&ctx), GuardResult::Allow);
    }

    #[test]
    fn tdd_refactor_follows_green_denies_when_refactor_is_not_preceded_by_green() {
        let ctx = ctx_with(map(vec![(
            "commit_messages",
            json!(["[RED] add failing test", "[REFACTOR] clean up"]),
        )]));
        assert!(matches!(tdd_refactor_follows_green(&ctx), GuardResult::Deny(_)));
    }

    #[test]
    fn tdd_refactor_follows_green_is_a_noop_when_last_commit_is_not_a_refactor() {
        let ctx = ctx_with(map(vec![(
            "commit_messages",
            json!(["[GREEN] implement", "[CHORE] unrelated"]),
        )]));
        assert_eq!(tdd_refactor_follows_green(&ctx), GuardResult::Allow);
    }

    #[test]
    fn standard_guards_are_all_registered_under_their_spec_names() {
        let mut registries = Registries::new();
        register_standard_guards(&mut registries);
        for name in [
            "AllTasksReady",
            "EvidencePresent",
            "ChildrenReady",
            "BundleApproved",
            "TDDRefactorFollowsGreen",
        ] {
            assert!(registries.has_guard(name), "missing guard {name}");
        }
    }
}
