//! Path & Config Resolver (C1): repo root discovery, layered YAML config.
//!
//! Config loads in search order — bundled defaults → each active pack's
//! overrides → project overlays at `.edison/config/*.yml` — merged by deep
//! recursive dict merge (lists replace). A missing file at any layer
//! contributes nothing rather than erroring.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use edison_core::state_machine::StateMachineSpec;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("missing required config key '{key_path}' (searched: {search_order})")]
    MissingKey { key_path: String, search_order: String },
    #[error("I/O error reading '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no repository root found: no ancestor of '{}' contains a .git directory", start.display())]
    RootNotFound { start: PathBuf },
}

/// Locate the project root: the nearest ancestor of `start` containing a
/// `.git` directory, unless `EDISON_ROOT` or `AGENTS_PROJECT_ROOT` names one
/// explicitly.
///
/// # Errors
/// Returns [`ConfigError::RootNotFound`] if no ancestor has a `.git` entry.
pub fn find_project_root(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(over) = std::env::var("EDISON_ROOT").or_else(|_| std::env::var("AGENTS_PROJECT_ROOT")) {
        return Ok(PathBuf::from(over));
    }
    let mut dir = start.to_owned();
    loop {
        if dir.join(".git").exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(ConfigError::RootNotFound {
                start: start.to_owned(),
            });
        }
    }
}

/// `{enable_sections, enable_dedupe, dedupe_shingle_size, enable_template_processing,
/// composition_mode, exclude_globs}` per content type (§4.8).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub enable_sections: bool,
    pub enable_dedupe: bool,
    pub dedupe_shingle_size: usize,
    pub enable_template_processing: bool,
    pub composition_mode: CompositionMode,
    pub exclude_globs: Vec<String>,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            enable_sections: true,
            enable_dedupe: false,
            dedupe_shingle_size: 12,
            enable_template_processing: true,
            composition_mode: CompositionMode::Section,
            exclude_globs: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    #[default]
    Section,
    Concatenate,
    YamlMerge,
}

/// Per-entity-kind state machine specs and retry policy (§4.5, §9).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub concurrent_modification_retry_limit: u32,
    /// Whether a `stale` session may resume without an explicit override
    /// (§9 Open Question — pinned in config, not hard-coded).
    pub allow_stale_session_resume: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub required_blocking_validators: Vec<String>,
    pub evidence_required_patterns: Vec<String>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            required_blocking_validators: Vec::new(),
            evidence_required_patterns: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub lock_timeout_ms: u64,
    pub lock_fail_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_fail_open: false,
        }
    }
}

/// Root of the merged, typed configuration tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdisonConfig {
    pub workflow: WorkflowConfig,
    pub qa: QaConfig,
    pub composition: BTreeMap<String, CompositionConfig>,
    pub session: SessionConfig,
    /// Task/QA/Session state machine specs (§4.5), keyed by entity kind
    /// (`"task"`, `"qa"`, `"session"`) as the Repository layer's
    /// `StateMachineRuntime` keys them.
    pub state_machines: HashMap<String, StateMachineSpec>,
}

const DEFAULT_CONFIG_YAML: &str = r#"
workflow:
  concurrent_modification_retry_limit: 3
  allow_stale_session_resume: false
qa:
  required_blocking_validators: []
  evidence_required_patterns: []
session:
  lock_timeout_ms: 5000
  lock_fail_open: false
composition: {}
state_machines:
  task:
    states:
      todo:
        initial: true
        allowed_transitions:
          - to: wip
      wip:
        allowed_transitions:
          - to: done
            guard: EvidencePresent
          - to: blocked
      blocked:
        allowed_transitions:
          - to: wip
            guard: ChildrenReady
      done:
        allowed_transitions:
          - to: validated
      validated:
        final: true
  qa:
    states:
      waiting:
        initial: true
        allowed_transitions:
          - to: todo
      todo:
        allowed_transitions:
          - to: wip
            guard: TDDRefactorFollowsGreen
      wip:
        allowed_transitions:
          - to: done
            guard: BundleApproved
      done:
        allowed_transitions:
          - to: validated
      validated:
        final: true
  session:
    states:
      wip:
        initial: true
        allowed_transitions:
          - to: closing
          - to: recovery
      closing:
        allowed_transitions:
          - to: done
            guard: AllTasksReady
          - to: recovery
      recovery:
        allowed_transitions:
          - to: wip
      done:
        allowed_transitions:
          - to: validated
      validated:
        final: true
"#;

/// Deep-merge `overlay` into `base`: mapping keys merge recursively;
/// anything else (scalars, sequences) is replaced wholesale by `overlay`.
/// Insertion order of pre-existing keys is preserved (`serde_yaml::Mapping`
/// is order-preserving); keys newly introduced by `overlay` are appended.
pub(crate) fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

fn load_yaml_layer(path: &Path) -> Result<Option<Value>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let value: Value = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_owned(),
                message: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io {
            path: path.to_owned(),
            source: e,
        }),
    }
}

/// The search order used to build one merged config tree, in precedence
/// order (later overrides earlier).
fn search_order(root: &Path, active_packs: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pack in active_packs {
        paths.push(root.join(".edison/packs").join(pack).join("config.yml"));
    }
    if let Ok(entries) = fs::read_dir(root.join(".edison/config")) {
        let mut project_files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "yml" || ext == "yaml"))
            .collect();
        project_files.sort();
        paths.extend(project_files);
    }
    paths
}

fn max_mtime(paths: &[PathBuf]) -> Option<SystemTime> {
    paths
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

struct CachedConfig {
    config: EdisonConfig,
    observed_mtime: Option<SystemTime>,
}

/// Caches the merged, typed configuration tree for a project root.
/// Read-mostly; invalidation (explicit `reset` or an mtime change across
/// the search order) is serialized by an internal lock.
pub struct ConfigResolver {
    root: PathBuf,
    active_packs: Vec<String>,
    cache: RwLock<Option<CachedConfig>>,
}

impl ConfigResolver {
    #[must_use]
    pub fn new(root: PathBuf, active_packs: Vec<String>) -> Self {
        Self {
            root,
            active_packs,
            cache: RwLock::new(None),
        }
    }

    /// Clear the cache unconditionally (for tests).
    pub fn reset(&self) {
        *self.cache.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Resolve the merged configuration, reusing the cache unless any file
    /// in the search order changed since it was built.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Io`] if a layer
    /// fails to load.
    pub fn resolve(&self) -> Result<EdisonConfig, ConfigError> {
        let paths = search_order(&self.root, &self.active_packs);
        let current_mtime = max_mtime(&paths);

        if let Some(cached) = self.cache.read().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
            if cached.observed_mtime == current_mtime {
                return Ok(cached.config.clone());
            }
        }

        let mut merged: Value = serde_yaml::from_str(DEFAULT_CONFIG_YAML).expect("built-in default config is valid YAML");
        for path in &paths {
            if let Some(layer) = load_yaml_layer(path)? {
                deep_merge(&mut merged, layer);
            }
        }

        let config: EdisonConfig = serde_yaml::from_value(merged).map_err(|e| ConfigError::Parse {
            path: self.root.join(".edison/config"),
            message: e.to_string(),
        })?;

        *self.cache.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(CachedConfig {
            config: config.clone(),
            observed_mtime: current_mtime,
        });
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_to_defaults_with_no_project_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(dir.path().to_owned(), vec![]);
        let cfg = resolver.resolve().unwrap();
        assert_eq!(cfg.workflow.concurrent_modification_retry_limit, 3);
        assert!(!cfg.workflow.allow_stale_session_resume);
        assert_eq!(cfg.session.lock_timeout_ms, 5000);
    }

    #[test]
    fn project_override_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".edison/config")).unwrap();
        fs::write(
            dir.path().join(".edison/config/project.yml"),
            "workflow:\n  allow_stale_session_resume: true\n",
        )
        .unwrap();
        let resolver = ConfigResolver::new(dir.path().to_owned(), vec![]);
        let cfg = resolver.resolve().unwrap();
        assert!(cfg.workflow.allow_stale_session_resume);
        // Untouched sibling keys keep their default.
        assert_eq!(cfg.workflow.concurrent_modification_retry_limit, 3);
    }

    #[test]
    fn pack_layer_applies_before_project_layer() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".edison/packs/alpha")).unwrap();
        fs::write(
            dir.path().join(".edison/packs/alpha/config.yml"),
            "workflow:\n  concurrent_modification_retry_limit: 10\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join(".edison/config")).unwrap();
        fs::write(
            dir.path().join(".edison/config/project.yml"),
            "workflow:\n  concurrent_modification_retry_limit: 20\n",
        )
        .unwrap();
        let resolver = ConfigResolver::new(dir.path().to_owned(), vec!["alpha".to_owned()]);
        let cfg = resolver.resolve().unwrap();
        assert_eq!(cfg.workflow.concurrent_modification_retry_limit, 20);
    }

    #[test]
    fn cache_reflects_file_changes_via_mtime() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".edison/config")).unwrap();
        let path = dir.path().join(".edison/config/project.yml");
        fs::write(&path, "workflow:\n  concurrent_modification_retry_limit: 1\n").unwrap();
        let resolver = ConfigResolver::new(dir.path().to_owned(), vec![]);
        assert_eq!(resolver.resolve().unwrap().workflow.concurrent_modification_retry_limit, 1);

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, "workflow:\n  concurrent_modification_retry_limit: 9\n").unwrap();
        assert_eq!(resolver.resolve().unwrap().workflow.concurrent_modification_retry_limit, 9);
    }

    #[test]
    fn reset_forces_a_fresh_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(dir.path().to_owned(), vec![]);
        let _ = resolver.resolve().unwrap();
        resolver.reset();
        assert!(resolver.cache.read().unwrap().is_none());
    }

    #[test]
    fn missing_project_root_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let isolated = dir.path().join("no-git-here");
        fs::create_dir_all(&isolated).unwrap();
        std::env::remove_var("EDISON_ROOT");
        std::env::remove_var("AGENTS_PROJECT_ROOT");
        let err = find_project_root(&isolated).unwrap_err();
        assert!(matches!(err, ConfigError::RootNotFound { .. }));
    }
}
