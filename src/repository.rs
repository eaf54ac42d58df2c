//! Repository Layer (C5): the generic persistence contract shared by
//! Task, QA, and Session storage, file-backed per §6.1/§6.2.
//!
//! `transition()` implements the nine-step pipeline of §4.5: fetch, lock,
//! build context, validate, execute, mutate, set-state-and-history,
//! atomic persist (move between per-state directories), audit record.
//! The per-entity lock (step 2) makes the common case single-shot; the
//! retry loop exists for the case the lock is bypassed (`fail_open`) and
//! a concurrent writer wins the race to move the old file first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edison_core::state_machine::{Registries, StateMachineRuntime, TransitionContext};
use edison_core::{QaRecord, Session, Task};
use serde_json::{Map, Value};

use crate::audit::{AuditLog, AuditRecord};
use crate::config::EdisonConfig;
use crate::error::EdisonError;
use crate::fileio::{self, acquire_file_lock};
use crate::guard::register_standard_guards;

/// Adapts an entity type to the generic transition pipeline. Implemented
/// once per entity kind in this module; the differing `record_transition`
/// signatures in `edison-core` (Task/QA take an `actor`, Session a
/// `reason`) are unified behind `apply_transition`'s single `note` field.
pub trait EntityRecord: Clone {
    fn id_str(&self) -> String;
    fn state(&self) -> &str;
    fn apply_transition(&mut self, to_state: &str, now: DateTime<Utc>, note: Option<String>);
    fn encode_text(&self) -> Result<String, EdisonError>;
    fn decode_text(text: &str) -> Result<Self, EdisonError>
    where
        Self: Sized;
}

impl EntityRecord for Task {
    fn id_str(&self) -> String {
        self.id.as_str().to_owned()
    }
    fn state(&self) -> &str {
        &self.state
    }
    fn apply_transition(&mut self, to_state: &str, now: DateTime<Utc>, note: Option<String>) {
        self.record_transition(to_state, now, note);
    }
    fn encode_text(&self) -> Result<String, EdisonError> {
        self.encode().map_err(|e| EdisonError::Validation(e.to_string()))
    }
    fn decode_text(text: &str) -> Result<Self, EdisonError> {
        Task::decode(text).map_err(|e| EdisonError::Validation(e.to_string()))
    }
}

impl EntityRecord for QaRecord {
    fn id_str(&self) -> String {
        self.id.as_str().to_owned()
    }
    fn state(&self) -> &str {
        &self.state
    }
    fn apply_transition(&mut self, to_state: &str, now: DateTime<Utc>, note: Option<String>) {
        self.record_transition(to_state, now, note);
    }
    fn encode_text(&self) -> Result<String, EdisonError> {
        self.encode().map_err(|e| EdisonError::Validation(e.to_string()))
    }
    fn decode_text(text: &str) -> Result<Self, EdisonError> {
        QaRecord::decode(text).map_err(|e| EdisonError::Validation(e.to_string()))
    }
}

impl EntityRecord for Session {
    fn id_str(&self) -> String {
        self.id.as_str().to_owned()
    }
    fn state(&self) -> &str {
        &self.state
    }
    fn apply_transition(&mut self, to_state: &str, now: DateTime<Utc>, note: Option<String>) {
        self.record_transition(to_state, now, note);
    }
    fn encode_text(&self) -> Result<String, EdisonError> {
        self.encode().map_err(|e| EdisonError::Validation(e.to_string()))
    }
    fn decode_text(text: &str) -> Result<Self, EdisonError> {
        Session::decode(text).map_err(|e| EdisonError::Validation(e.to_string()))
    }
}

type PathBuilder = Arc<dyn Fn(&Path, &str, &str) -> PathBuf + Send + Sync>;
type StateDir = Arc<dyn Fn(&Path, &str) -> PathBuf + Send + Sync>;
type IdsInState = Arc<dyn Fn(&Path, &str) -> Vec<String> + Send + Sync>;

/// Layout-specific plumbing an entity kind needs: where a given id's file
/// lives for a given state, the directory that holds a whole state, and
/// how to enumerate ids already present under a state directory.
#[derive(Clone)]
struct FileLayout {
    kind: &'static str,
    states: Vec<String>,
    path_for: PathBuilder,
    dir_for: StateDir,
    ids_in: IdsInState,
}

fn scan_ids_by_suffix(dir: &Path, suffix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .filter_map(|name| name.strip_suffix(suffix).map(str::to_owned))
        .collect()
}

fn task_layout() -> FileLayout {
    FileLayout {
        kind: "task",
        states: ["todo", "wip", "done", "validated", "blocked"].map(str::to_owned).to_vec(),
        path_for: Arc::new(|root, state, id| root.join(".project/tasks").join(state).join(format!("{id}.md"))),
        dir_for: Arc::new(|root, state| root.join(".project/tasks").join(state)),
        ids_in: Arc::new(|dir, _state| scan_ids_by_suffix(dir, ".md")),
    }
}

fn qa_layout() -> FileLayout {
    FileLayout {
        kind: "qa",
        states: ["waiting", "todo", "wip", "done", "validated"].map(str::to_owned).to_vec(),
        path_for: Arc::new(|root, state, id| root.join(".project/qa").join(state).join(format!("{id}.md"))),
        dir_for: Arc::new(|root, state| root.join(".project/qa").join(state)),
        ids_in: Arc::new(|dir, _state| scan_ids_by_suffix(dir, ".md")),
    }
}

fn session_layout() -> FileLayout {
    FileLayout {
        kind: "session",
        states: ["wip", "done", "validated", "recovery", "closing"].map(str::to_owned).to_vec(),
        path_for: Arc::new(|root, state, id| root.join(".project/sessions").join(state).join(id).join("session.json")),
        dir_for: Arc::new(|root, state| root.join(".project/sessions").join(state)),
        ids_in: Arc::new(|dir, _state| {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return Vec::new();
            };
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().join("session.json").is_file())
                .filter_map(|e| e.file_name().to_str().map(str::to_owned))
                .collect()
        }),
    }
}

const SESSION_STATES: [&str; 5] = ["wip", "done", "validated", "recovery", "closing"];

/// Locate a session's directory by scanning its possible state buckets,
/// defaulting to `wip` if the session isn't found under any of them yet
/// (a caller relocating a Task into a session that doesn't exist on disk
/// gets a clear `EntityNotFound` from the session repository instead).
fn find_session_dir(root: &Path, session_id: &str) -> PathBuf {
    for state in SESSION_STATES {
        let dir = root.join(".project/sessions").join(state).join(session_id);
        if dir.is_dir() {
            return dir;
        }
    }
    root.join(".project/sessions/wip").join(session_id)
}

/// A Task mirror scoped to one session's sub-tree: `sessions/{state}/
/// {session_id}/tasks/{state}/{id}.md` (§6.1). The session's own current
/// state bucket is resolved at call time via [`find_session_dir`].
fn session_scoped_task_layout(session_id: &str) -> FileLayout {
    let for_path = session_id.to_owned();
    let for_dir = session_id.to_owned();
    FileLayout {
        kind: "task",
        states: ["todo", "wip", "done", "validated", "blocked"].map(str::to_owned).to_vec(),
        path_for: Arc::new(move |root, state, id| {
            find_session_dir(root, &for_path).join("tasks").join(state).join(format!("{id}.md"))
        }),
        dir_for: Arc::new(move |root, state| find_session_dir(root, &for_dir).join("tasks").join(state)),
        ids_in: Arc::new(|dir, _state| scan_ids_by_suffix(dir, ".md")),
    }
}

/// A QA mirror scoped to one session's sub-tree, mirroring
/// [`session_scoped_task_layout`].
fn session_scoped_qa_layout(session_id: &str) -> FileLayout {
    let for_path = session_id.to_owned();
    let for_dir = session_id.to_owned();
    FileLayout {
        kind: "qa",
        states: ["waiting", "todo", "wip", "done", "validated"].map(str::to_owned).to_vec(),
        path_for: Arc::new(move |root, state, id| {
            find_session_dir(root, &for_path).join("qa").join(state).join(format!("{id}.md"))
        }),
        dir_for: Arc::new(move |root, state| find_session_dir(root, &for_dir).join("qa").join(state)),
        ids_in: Arc::new(|dir, _state| scan_ids_by_suffix(dir, ".md")),
    }
}

/// File-backed `BaseRepository<E>` for one entity kind.
pub struct FileRepository<E: EntityRecord> {
    root: PathBuf,
    management_dir: PathBuf,
    layout: FileLayout,
    runtime: Arc<StateMachineRuntime>,
    audit: AuditLog,
    retry_limit: u32,
    lock_timeout: Duration,
    lock_fail_open: bool,
    _marker: std::marker::PhantomData<E>,
}

impl FileRepository<Task> {
    #[must_use]
    pub fn for_tasks(
        root: PathBuf,
        management_dir: PathBuf,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        Self::new(root, management_dir, task_layout(), runtime, retry_limit, lock_timeout, lock_fail_open)
    }

    /// A Task repository scoped to one session's sub-tree (§6.1), used once
    /// a Task has been claimed into a session.
    #[must_use]
    pub fn for_session_scoped_tasks(
        root: PathBuf,
        management_dir: PathBuf,
        session_id: &str,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        Self::new(
            root,
            management_dir,
            session_scoped_task_layout(session_id),
            runtime,
            retry_limit,
            lock_timeout,
            lock_fail_open,
        )
    }

    /// Walk the `parent_id` chain starting at `first_parent_id`, rejecting
    /// it if it never resolves (I6: dangling parent) or if it loops back
    /// to `new_id` (I6: cycle).
    fn check_no_ancestor_cycle(&self, new_id: &str, first_parent_id: &str) -> Result<(), EdisonError> {
        let mut current = first_parent_id.to_owned();
        loop {
            if current == new_id {
                return Err(EdisonError::Validation(format!(
                    "parent_id chain starting at '{first_parent_id}' cycles back to '{new_id}'"
                )));
            }
            let Some(parent) = self.get(&current)? else {
                return Err(EdisonError::Validation(format!(
                    "parent_id '{current}' does not reference an existing task"
                )));
            };
            match parent.parent_id {
                Some(next) => current = next.as_str().to_owned(),
                None => return Ok(()),
            }
        }
    }

    /// `create()` plus I6: a `parent_id` must resolve to an existing Task
    /// and its ancestor chain must not cycle back to `task`'s own id.
    ///
    /// # Errors
    /// `EdisonError::Validation` if `parent_id` is dangling or closes a
    /// cycle; otherwise as `create()`.
    pub fn create_task(&self, task: &Task) -> Result<(), EdisonError> {
        if let Some(parent_id) = &task.parent_id {
            self.check_no_ancestor_cycle(&task.id_str(), parent_id.as_str())?;
        }
        self.create(task)
    }
}

impl FileRepository<QaRecord> {
    #[must_use]
    pub fn for_qa(
        root: PathBuf,
        management_dir: PathBuf,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        Self::new(root, management_dir, qa_layout(), runtime, retry_limit, lock_timeout, lock_fail_open)
    }

    /// A QA repository scoped to one session's sub-tree (§6.1).
    #[must_use]
    pub fn for_session_scoped_qa(
        root: PathBuf,
        management_dir: PathBuf,
        session_id: &str,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        Self::new(
            root,
            management_dir,
            session_scoped_qa_layout(session_id),
            runtime,
            retry_limit,
            lock_timeout,
            lock_fail_open,
        )
    }
}

impl FileRepository<Session> {
    #[must_use]
    pub fn for_sessions(
        root: PathBuf,
        management_dir: PathBuf,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        Self::new(root, management_dir, session_layout(), runtime, retry_limit, lock_timeout, lock_fail_open)
    }
}

enum PersistOutcome {
    Done,
    Race,
}

impl<E: EntityRecord> FileRepository<E> {
    fn new(
        root: PathBuf,
        management_dir: PathBuf,
        layout: FileLayout,
        runtime: Arc<StateMachineRuntime>,
        retry_limit: u32,
        lock_timeout: Duration,
        lock_fail_open: bool,
    ) -> Self {
        let audit = AuditLog::new(management_dir.clone());
        Self {
            root,
            management_dir,
            layout,
            runtime,
            audit,
            retry_limit,
            lock_timeout,
            lock_fail_open,
            _marker: std::marker::PhantomData,
        }
    }

    fn fetch_with_state(&self, id: &str) -> Result<Option<(E, String, PathBuf)>, EdisonError> {
        for state in &self.layout.states {
            let path = (self.layout.path_for)(&self.root, state, id);
            if path.is_file() {
                let text = fileio::read_text(&path)?;
                let entity = E::decode_text(&text)?;
                return Ok(Some((entity, state.clone(), path)));
            }
        }
        Ok(None)
    }

    /// # Errors
    /// Returns [`EdisonError::EntityNotFound`] if no id's file exists.
    pub fn get(&self, id: &str) -> Result<Option<E>, EdisonError> {
        Ok(self.fetch_with_state(id)?.map(|(e, _, _)| e))
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.layout.states.iter().any(|s| (self.layout.path_for)(&self.root, s, id).is_file())
    }

    pub fn create(&self, entity: &E) -> Result<(), EdisonError> {
        let id = entity.id_str();
        if self.exists(&id) {
            return Err(EdisonError::EntityAlreadyExists {
                kind: self.layout.kind.to_owned(),
                id,
            });
        }
        let path = (self.layout.path_for)(&self.root, entity.state(), &id);
        let text = entity.encode_text()?;
        fileio::write_text_locked(&path, &text, self.lock_timeout, self.lock_fail_open)?;
        Ok(())
    }

    /// Overwrite the entity at its current (unchanged) state path.
    pub fn save(&self, entity: &E) -> Result<(), EdisonError> {
        let path = (self.layout.path_for)(&self.root, entity.state(), &entity.id_str());
        let text = entity.encode_text()?;
        fileio::write_text_locked(&path, &text, self.lock_timeout, self.lock_fail_open)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool, EdisonError> {
        let Some((_, _, path)) = self.fetch_with_state(id)? else {
            return Ok(false);
        };
        std::fs::remove_file(&path).map_err(|source| EdisonError::IoFailure(crate::fileio::FileIoError::Io {
            path: path.clone(),
            source,
        }))?;
        Ok(true)
    }

    pub fn list_by_state(&self, state: &str) -> Result<Vec<E>, EdisonError> {
        let dir = (self.layout.dir_for)(&self.root, state);
        let ids = (self.layout.ids_in)(&dir, state);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let path = (self.layout.path_for)(&self.root, state, &id);
            let text = fileio::read_text(&path)?;
            out.push(E::decode_text(&text)?);
        }
        Ok(out)
    }

    pub fn list_all(&self) -> Result<Vec<E>, EdisonError> {
        let mut all = Vec::new();
        for state in self.layout.states.clone() {
            all.extend(self.list_by_state(&state)?);
        }
        Ok(all)
    }

    pub fn find(&self, predicate: impl Fn(&E) -> bool) -> Result<Vec<E>, EdisonError> {
        Ok(self.list_all()?.into_iter().filter(|e| predicate(e)).collect())
    }

    fn persist_transition(&self, from_path: &Path, to_path: &Path, entity: &E) -> Result<PersistOutcome, EdisonError> {
        if from_path != to_path && !from_path.is_file() {
            return Ok(PersistOutcome::Race);
        }
        let text = entity.encode_text()?;
        fileio::write_text_locked(to_path, &text, self.lock_timeout, self.lock_fail_open)?;
        if from_path != to_path {
            if !from_path.is_file() {
                // another writer removed it while we wrote the new file;
                // the new file is already in place so we cannot cleanly
                // back out — treat as committed rather than losing data.
                return Ok(PersistOutcome::Done);
            }
            std::fs::remove_file(from_path).map_err(|source| {
                EdisonError::IoFailure(crate::fileio::FileIoError::Io {
                    path: from_path.to_owned(),
                    source,
                })
            })?;
        }
        Ok(PersistOutcome::Done)
    }

    /// Run the nine-step transition pipeline. `context_overlay` seeds
    /// `TransitionContext::vars` (guard/condition/action inputs); `mutate`
    /// runs after the plan's actions, before state/history are finalized.
    ///
    /// # Errors
    /// `EntityNotFound`, any `StateMachineError` (wrapped), or
    /// `ConcurrentModification` if the retry budget is exhausted.
    pub fn transition(
        &self,
        id: &str,
        to_state: &str,
        context_overlay: Map<String, Value>,
        reason: Option<String>,
        mutate: Option<&dyn Fn(&mut E)>,
    ) -> Result<E, EdisonError> {
        let lock_path = self.management_dir.join("locks").join(self.layout.kind).join(id);
        let _guard = acquire_file_lock(&lock_path, self.lock_timeout, self.lock_fail_open)?;

        let attempts = self.retry_limit.max(1);
        for attempt in 0..attempts {
            let Some((mut entity, from_state, from_path)) = self.fetch_with_state(id)? else {
                return Err(EdisonError::EntityNotFound {
                    kind: self.layout.kind.to_owned(),
                    id: id.to_owned(),
                });
            };

            let now = Utc::now();
            let mut ctx = TransitionContext::new(now);
            ctx.vars = context_overlay.clone();
            ctx.set("entity_id", entity.id_str());
            ctx.set("from_state", from_state.clone());
            ctx.set("to_state", to_state.to_owned());

            let plan = self.runtime.validate_transition(self.layout.kind, &from_state, to_state, &ctx)?;
            self.runtime.execute(&plan, &mut ctx)?;

            if let Some(mutate) = mutate {
                mutate(&mut entity);
            }
            entity.apply_transition(to_state, now, reason.clone());

            let to_path = (self.layout.path_for)(&self.root, to_state, &entity.id_str());
            match self.persist_transition(&from_path, &to_path, &entity)? {
                PersistOutcome::Done => {
                    self.audit.append(&AuditRecord {
                        timestamp: now,
                        session_id: None,
                        entity_kind: self.layout.kind.to_owned(),
                        entity_id: entity.id_str(),
                        from: from_state,
                        to: to_state.to_owned(),
                        reason: reason.clone(),
                        actor: None,
                    })?;
                    return Ok(entity);
                }
                PersistOutcome::Race => {
                    if attempt + 1 == attempts {
                        break;
                    }
                }
            }
        }

        Err(EdisonError::ConcurrentModification { attempts })
    }

    /// Like `transition`, but persists the result under `target`'s layout
    /// instead of `self`'s, so a single call both changes state and
    /// relocates the file — e.g. claiming a Task into a session's
    /// sub-tree in one step (§6.1, §8 claim flow).
    ///
    /// # Errors
    /// As `transition`.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_into(
        &self,
        target: &FileRepository<E>,
        id: &str,
        to_state: &str,
        context_overlay: Map<String, Value>,
        reason: Option<String>,
        mutate: Option<&dyn Fn(&mut E)>,
    ) -> Result<E, EdisonError> {
        let lock_path = self.management_dir.join("locks").join(self.layout.kind).join(id);
        let _guard = acquire_file_lock(&lock_path, self.lock_timeout, self.lock_fail_open)?;

        let attempts = self.retry_limit.max(1);
        for attempt in 0..attempts {
            let Some((mut entity, from_state, from_path)) = self.fetch_with_state(id)? else {
                return Err(EdisonError::EntityNotFound {
                    kind: self.layout.kind.to_owned(),
                    id: id.to_owned(),
                });
            };

            let now = Utc::now();
            let mut ctx = TransitionContext::new(now);
            ctx.vars = context_overlay.clone();
            ctx.set("entity_id", entity.id_str());
            ctx.set("from_state", from_state.clone());
            ctx.set("to_state", to_state.to_owned());

            let plan = self.runtime.validate_transition(self.layout.kind, &from_state, to_state, &ctx)?;
            self.runtime.execute(&plan, &mut ctx)?;

            if let Some(mutate) = mutate {
                mutate(&mut entity);
            }
            entity.apply_transition(to_state, now, reason.clone());

            let to_path = (target.layout.path_for)(&target.root, to_state, &entity.id_str());
            match self.persist_transition(&from_path, &to_path, &entity)? {
                PersistOutcome::Done => {
                    self.audit.append(&AuditRecord {
                        timestamp: now,
                        session_id: None,
                        entity_kind: self.layout.kind.to_owned(),
                        entity_id: entity.id_str(),
                        from: from_state,
                        to: to_state.to_owned(),
                        reason: reason.clone(),
                        actor: None,
                    })?;
                    return Ok(entity);
                }
                PersistOutcome::Race => {
                    if attempt + 1 == attempts {
                        break;
                    }
                }
            }
        }

        Err(EdisonError::ConcurrentModification { attempts })
    }
}

/// The Task/QA/Session repositories a running process needs, sharing one
/// `StateMachineRuntime` built from config (§6.9).
pub struct Repositories {
    pub tasks: FileRepository<Task>,
    pub qa: FileRepository<QaRecord>,
    pub sessions: FileRepository<Session>,
}

/// Build a runtime carrying the standard guards plus whichever
/// Task/QA/Session state machine specs `config.state_machines` bundles.
///
/// # Errors
/// `EdisonError::StateMachine` if a spec references an unregistered
/// guard, condition, or action, or is otherwise malformed.
pub fn build_runtime(config: &EdisonConfig) -> Result<Arc<StateMachineRuntime>, EdisonError> {
    let mut registries = Registries::new();
    register_standard_guards(&mut registries);

    let mut runtime = StateMachineRuntime::new(registries);
    for (kind, spec) in &config.state_machines {
        runtime.add_spec(kind.as_str(), spec.clone())?;
    }
    Ok(Arc::new(runtime))
}

/// Assemble the Task/QA/Session repositories, wiring `config`'s state
/// machine specs, retry limit, and session lock settings into each.
///
/// # Errors
/// As `build_runtime`.
pub fn build_repositories(
    root: PathBuf,
    management_dir: PathBuf,
    config: &EdisonConfig,
) -> Result<Repositories, EdisonError> {
    let runtime = build_runtime(config)?;
    let retry_limit = config.workflow.concurrent_modification_retry_limit;
    let lock_timeout = Duration::from_millis(config.session.lock_timeout_ms);
    let lock_fail_open = config.session.lock_fail_open;

    Ok(Repositories {
        tasks: FileRepository::for_tasks(
            root.clone(),
            management_dir.clone(),
            Arc::clone(&runtime),
            retry_limit,
            lock_timeout,
            lock_fail_open,
        ),
        qa: FileRepository::for_qa(
            root.clone(),
            management_dir.clone(),
            Arc::clone(&runtime),
            retry_limit,
            lock_timeout,
            lock_fail_open,
        ),
        sessions: FileRepository::for_sessions(root, management_dir, runtime, retry_limit, lock_timeout, lock_fail_open),
    })
}
