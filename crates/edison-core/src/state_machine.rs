//! Declarative state machine runtime (C3).
//!
//! A [`StateMachineSpec`] is parsed once per entity kind from configuration
//! and validated at load time. [`StateMachineRuntime::validate_transition`]
//! checks a requested move is declared and permitted; the resulting
//! [`TransitionPlan`] is handed to [`StateMachineRuntime::execute`] to run
//! its actions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Mutable evaluation context shared by conditions, guards, and actions.
///
/// Built by the caller (typically the Repository layer) as "caller-supplied
/// fields overlaid on `{entity, now, repo_root}`" per the transition
/// contract; actions may read and write `vars` but cannot trigger another
/// validation pass.
#[derive(Clone, Debug, Default)]
pub struct TransitionContext {
    pub now: Option<DateTime<Utc>>,
    pub vars: Map<String, Value>,
}

impl TransitionContext {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Some(now),
            vars: Map::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Truthiness as used by `{{#if}}` and condition evaluation: non-empty
    /// string/list/map, non-zero number, `true`.
    #[must_use]
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.vars.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }
}

/// Outcome of evaluating a named guard predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardResult {
    Allow,
    Deny(String),
}

type GuardFn = dyn Fn(&TransitionContext) -> GuardResult + Send + Sync;
type ConditionFn = dyn Fn(&TransitionContext) -> bool + Send + Sync;
type ActionFn = dyn Fn(&mut TransitionContext) + Send + Sync;

/// Name-keyed function registries. `UnknownPredicate` is detected at load
/// time against this registry, never at transition time.
#[derive(Clone, Default)]
pub struct Registries {
    guards: HashMap<String, Arc<GuardFn>>,
    conditions: HashMap<String, Arc<ConditionFn>>,
    actions: HashMap<String, Arc<ActionFn>>,
}

impl Registries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_guard(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&TransitionContext) -> GuardResult + Send + Sync + 'static,
    ) {
        self.guards.insert(name.into(), Arc::new(f));
    }

    pub fn register_condition(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&TransitionContext) -> bool + Send + Sync + 'static,
    ) {
        self.conditions.insert(name.into(), Arc::new(f));
    }

    pub fn register_action(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&mut TransitionContext) + Send + Sync + 'static,
    ) {
        self.actions.insert(name.into(), Arc::new(f));
    }

    #[must_use]
    pub fn has_guard(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    #[must_use]
    pub fn has_condition(&self, name: &str) -> bool {
        self.conditions.contains_key(name)
    }

    #[must_use]
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

/// `{name, error?, or?}` — a condition holds if its named predicate returns
/// true, or (for an `or` group) if any sub-condition holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub or: Vec<ConditionSpec>,
}

/// One declared transition out of a state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub to: String,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// One declared state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    #[serde(default)]
    pub initial: bool,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    #[serde(default)]
    pub allowed_transitions: Vec<TransitionSpec>,
}

/// The full declarative machine for one entity kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMachineSpec {
    pub states: HashMap<String, StateSpec>,
}

/// Load-time / evaluation errors, matching the §7 taxonomy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("duplicate state '{0}' in machine spec")]
    DuplicateState(String),
    #[error("transition from '{from}' to undeclared state '{to}'")]
    UndeclaredTargetState { from: String, to: String },
    #[error("transition from '{from}' to '{to}' references unknown guard '{name}'")]
    UnknownGuardRef { from: String, to: String, name: String },
    #[error("transition from '{from}' to '{to}' references unknown action '{name}'")]
    UnknownActionRef { from: String, to: String, name: String },
    #[error("transition from '{from}' to '{to}' references unknown condition '{name}'")]
    UnknownConditionRef { from: String, to: String, name: String },
    #[error("no transition declared from '{from}' to '{to}'")]
    NoSuchTransition { from: String, to: String },
    #[error("condition '{0}' failed: {1}")]
    ConditionFailed(String, String),
    #[error("guard '{0}' denied: {1}")]
    GuardDenied(String, String),
    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),
    #[error("no such entity kind '{0}' registered with the runtime")]
    UnknownEntityKind(String),
}

/// The set of actions (in declared order) to run for an approved transition.
#[derive(Clone, Debug)]
pub struct TransitionPlan {
    pub from: String,
    pub to: String,
    pub actions: Vec<String>,
}

impl StateMachineSpec {
    /// Load-time validation: reject duplicate states (impossible via a
    /// `HashMap` key collision, but a transition's `to` must name a
    /// declared state, and every `guard`/`condition`/`action` reference
    /// must resolve in `registries`).
    pub fn validate(&self, registries: &Registries) -> Result<(), StateMachineError> {
        for (from, state) in &self.states {
            for transition in &state.allowed_transitions {
                if !self.states.contains_key(&transition.to) {
                    return Err(StateMachineError::UndeclaredTargetState {
                        from: from.clone(),
                        to: transition.to.clone(),
                    });
                }
                if let Some(guard) = &transition.guard {
                    if !registries.has_guard(guard) {
                        return Err(StateMachineError::UnknownGuardRef {
                            from: from.clone(),
                            to: transition.to.clone(),
                            name: guard.clone(),
                        });
                    }
                }
                for action in &transition.actions {
                    if !registries.has_action(action) {
                        return Err(StateMachineError::UnknownActionRef {
                            from: from.clone(),
                            to: transition.to.clone(),
                            name: action.clone(),
                        });
                    }
                }
                for condition in &transition.conditions {
                    Self::validate_condition(from, &transition.to, condition, registries)?;
                }
            }
        }
        Ok(())
    }

    fn validate_condition(
        from: &str,
        to: &str,
        condition: &ConditionSpec,
        registries: &Registries,
    ) -> Result<(), StateMachineError> {
        if !condition.or.is_empty() {
            for sub in &condition.or {
                Self::validate_condition(from, to, sub, registries)?;
            }
            return Ok(());
        }
        match &condition.name {
            Some(name) if registries.has_condition(name) => Ok(()),
            Some(name) => Err(StateMachineError::UnknownConditionRef {
                from: from.to_owned(),
                to: to.to_owned(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn find_transition(&self, from: &str, to: &str) -> Option<&TransitionSpec> {
        self.states
            .get(from)?
            .allowed_transitions
            .iter()
            .find(|t| t.to == to)
    }
}

fn evaluate_condition(
    condition: &ConditionSpec,
    ctx: &TransitionContext,
    registries: &Registries,
) -> Result<(), StateMachineError> {
    if !condition.or.is_empty() {
        let mut last_err = None;
        for sub in &condition.or {
            match evaluate_condition(sub, ctx, registries) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        return Err(last_err.unwrap_or_else(|| {
            StateMachineError::ConditionFailed("or".to_owned(), "empty or-group".to_owned())
        }));
    }
    let Some(name) = &condition.name else {
        return Ok(());
    };
    let Some(predicate) = registries.conditions.get(name) else {
        return Err(StateMachineError::UnknownPredicate(name.clone()));
    };
    if predicate(ctx) {
        Ok(())
    } else {
        let message = condition
            .error
            .clone()
            .unwrap_or_else(|| format!("predicate '{name}' returned false"));
        Err(StateMachineError::ConditionFailed(name.clone(), message))
    }
}

/// Runs one or more [`StateMachineSpec`]s (one per entity kind) against a
/// shared [`Registries`].
#[derive(Clone, Default)]
pub struct StateMachineRuntime {
    specs: HashMap<String, StateMachineSpec>,
    registries: Registries,
}

impl StateMachineRuntime {
    #[must_use]
    pub fn new(registries: Registries) -> Self {
        Self {
            specs: HashMap::new(),
            registries,
        }
    }

    /// Register a validated machine spec for `entity_kind`.
    pub fn add_spec(
        &mut self,
        entity_kind: impl Into<String>,
        spec: StateMachineSpec,
    ) -> Result<(), StateMachineError> {
        spec.validate(&self.registries)?;
        self.specs.insert(entity_kind.into(), spec);
        Ok(())
    }

    pub fn validate_transition(
        &self,
        entity_kind: &str,
        from_state: &str,
        to_state: &str,
        ctx: &TransitionContext,
    ) -> Result<TransitionPlan, StateMachineError> {
        let spec = self
            .specs
            .get(entity_kind)
            .ok_or_else(|| StateMachineError::UnknownEntityKind(entity_kind.to_owned()))?;

        let transition = spec.find_transition(from_state, to_state).ok_or_else(|| {
            StateMachineError::NoSuchTransition {
                from: from_state.to_owned(),
                to: to_state.to_owned(),
            }
        })?;

        for condition in &transition.conditions {
            evaluate_condition(condition, ctx, &self.registries)?;
        }

        if let Some(guard_name) = &transition.guard {
            let guard = self
                .registries
                .guards
                .get(guard_name)
                .ok_or_else(|| StateMachineError::UnknownPredicate(guard_name.clone()))?;
            if let GuardResult::Deny(message) = guard(ctx) {
                return Err(StateMachineError::GuardDenied(guard_name.clone(), message));
            }
        }

        Ok(TransitionPlan {
            from: from_state.to_owned(),
            to: to_state.to_owned(),
            actions: transition.actions.clone(),
        })
    }

    /// Run a plan's actions in declared order against a mutable context.
    /// Actions cannot trigger another `validate_transition` call.
    pub fn execute(
        &self,
        plan: &TransitionPlan,
        ctx: &mut TransitionContext,
    ) -> Result<(), StateMachineError> {
        for action_name in &plan.actions {
            let action = self
                .registries
                .actions
                .get(action_name)
                .ok_or_else(|| StateMachineError::UnknownPredicate(action_name.clone()))?;
            action(ctx);
        }
        Ok(())
    }
}
