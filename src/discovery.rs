//! Layered Discovery (C6): enumerate entity sources across Core → Packs →
//! User → Project layers with shadow/overlay rules.
//!
//! Mirrors `composition/core/discovery.py`: entity keys are POSIX relative
//! paths minus extension (subdirectory nesting preserved); `overlays/` is
//! detected by path-component membership, not suffix matching; "new
//! definition" scans skip anything under an `overlays/` directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(
        "{layer} file '{}' shadows existing {content_type} '{id}'.\nTo extend it, place the file under an overlays/ directory instead.\nTo create a new {content_type}, use a unique name.",
        path.display()
    )]
    Shadowing {
        layer: String,
        content_type: String,
        id: String,
        path: PathBuf,
    },
    #[error(
        "{layer} overlay '{}' references non-existent {content_type} '{id}'.\nCreate the base {content_type} outside overlays/ first.",
        path.display()
    )]
    DanglingOverlay {
        layer: String,
        content_type: String,
        id: String,
        path: PathBuf,
    },
    #[error("I/O error scanning '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single discovered source file together with its layer provenance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSource {
    pub path: PathBuf,
    pub layer: String,
    pub is_overlay: bool,
    pub entity_name: String,
}

/// `(kind_label, root_dir)` — a pack root in low→high precedence order.
pub type PackRoot = (String, PathBuf);

/// Discovers entities of one `content_type` (e.g. `agents`, `validators`)
/// across layers, caching scans per `(layer, pack, content_type)`.
pub struct LayerDiscovery {
    content_type: String,
    core_dir: PathBuf,
    pack_roots: Vec<PackRoot>,
    user_dir: PathBuf,
    project_dir: PathBuf,
    file_ext: String,
    exclude_globs: Vec<String>,
    cache: std::sync::Mutex<DiscoveryCache>,
}

#[derive(Default)]
struct DiscoveryCache {
    core: Option<(BTreeMap<String, LayerSource>, u64)>,
    pack_new: HashMap<(String, String), (BTreeMap<String, LayerSource>, u64)>,
    pack_overlay: HashMap<(String, String), (BTreeMap<String, LayerSource>, u64)>,
    user_new: Option<(BTreeMap<String, LayerSource>, u64)>,
    user_overlay: Option<(BTreeMap<String, LayerSource>, u64)>,
    project_new: Option<(BTreeMap<String, LayerSource>, u64)>,
    project_overlay: Option<(BTreeMap<String, LayerSource>, u64)>,
}

fn mtime_key(dir: &Path) -> u64 {
    fs_mtime(dir).unwrap_or(0)
}

fn fs_mtime(dir: &Path) -> Option<u64> {
    let meta = std::fs::metadata(dir).ok()?;
    let modified = meta.modified().ok()?;
    modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

impl LayerDiscovery {
    #[must_use]
    pub fn new(
        content_type: impl Into<String>,
        core_dir: impl Into<PathBuf>,
        pack_roots: Vec<PackRoot>,
        user_dir: impl Into<PathBuf>,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            core_dir: core_dir.into(),
            pack_roots,
            user_dir: user_dir.into(),
            project_dir: project_dir.into(),
            file_ext: "md".to_owned(),
            exclude_globs: Vec::new(),
            cache: std::sync::Mutex::new(DiscoveryCache::default()),
        }
    }

    #[must_use]
    pub fn with_exclude_globs(mut self, globs: Vec<String>) -> Self {
        self.exclude_globs = globs;
        self
    }

    #[must_use]
    pub fn with_file_ext(mut self, ext: impl Into<String>) -> Self {
        self.file_ext = ext.into();
        self
    }

    /// Reset every cache slot (used when a layer root's mtime does not
    /// change but a test/caller wants to force a rescan).
    pub fn reset_cache(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = DiscoveryCache::default();
    }

    fn entity_key(&self, base_dir: &Path, file_path: &Path) -> Option<String> {
        let rel = file_path.strip_prefix(base_dir).ok()?;
        let mut rel = rel.to_owned();
        rel.set_extension("");
        Some(rel.to_str()?.replace('\\', "/"))
    }

    fn is_excluded(&self, base_dir: &Path, file_path: &Path) -> bool {
        if self.exclude_globs.is_empty() {
            return false;
        }
        let Ok(rel) = file_path.strip_prefix(base_dir) else {
            return false;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        self.exclude_globs
            .iter()
            .any(|pat| glob::Pattern::new(pat).is_ok_and(|p| p.matches(&rel)))
    }

    fn walk_sorted(&self, dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| DiscoveryError::Io {
                path: dir.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.file_ext.as_str()) {
                continue;
            }
            found.push(path.to_owned());
        }
        Ok(found)
    }

    fn scan_new(
        &self,
        base: &Path,
        label: &str,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let type_dir = base.join(&self.content_type);
        let mut out = BTreeMap::new();
        for path in self.walk_sorted(&type_dir)? {
            if path.components().any(|c| c.as_os_str() == "overlays") {
                continue;
            }
            if self.is_excluded(&type_dir, &path) {
                continue;
            }
            let Some(name) = self.entity_key(&type_dir, &path) else {
                continue;
            };
            out.insert(
                name.clone(),
                LayerSource {
                    path,
                    layer: label.to_owned(),
                    is_overlay: false,
                    entity_name: name,
                },
            );
        }
        Ok(out)
    }

    fn scan_overlays(
        &self,
        base: &Path,
        label: &str,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let overlays_dir = base.join(&self.content_type).join("overlays");
        let mut out = BTreeMap::new();
        for path in self.walk_sorted(&overlays_dir)? {
            if self.is_excluded(&overlays_dir, &path) {
                continue;
            }
            let Some(name) = self.entity_key(&overlays_dir, &path) else {
                continue;
            };
            out.insert(
                name.clone(),
                LayerSource {
                    path,
                    layer: label.to_owned(),
                    is_overlay: true,
                    entity_name: name,
                },
            );
        }
        Ok(out)
    }

    /// Discover all core entity definitions.
    pub fn discover_core(&self) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let key = mtime_key(&self.core_dir);
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((entities, cached_key)) = &cache.core {
                if *cached_key == key {
                    return Ok(entities.clone());
                }
            }
        }
        let entities = self.scan_new(&self.core_dir, "core")?;
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).core = Some((entities.clone(), key));
        Ok(entities)
    }

    fn scan_pack_new(
        &self,
        pack_root: &Path,
        pack: &str,
        kind: &str,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let cache_key = (kind.to_owned(), pack.to_owned());
        let base = pack_root.join(pack);
        let key = mtime_key(&base);
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((entities, cached_key)) = cache.pack_new.get(&cache_key) {
                if *cached_key == key {
                    return Ok(entities.clone());
                }
            }
        }
        let entities = self.scan_new(&base, &format!("pack:{pack}"))?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pack_new
            .insert(cache_key, (entities.clone(), key));
        Ok(entities)
    }

    fn scan_pack_overlays(
        &self,
        pack_root: &Path,
        pack: &str,
        kind: &str,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let cache_key = (kind.to_owned(), pack.to_owned());
        let base = pack_root.join(pack);
        let key = mtime_key(&base);
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((entities, cached_key)) = cache.pack_overlay.get(&cache_key) {
                if *cached_key == key {
                    return Ok(entities.clone());
                }
            }
        }
        let entities = self.scan_overlays(&base, &format!("pack:{pack}"))?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pack_overlay
            .insert(cache_key, (entities.clone(), key));
        Ok(entities)
    }

    /// Discover pack new+overlay sources across all pack roots in
    /// precedence order, validating shadow/dangling-overlay rules and
    /// folding newly discovered pack entities into `existing`.
    pub fn iter_pack_layers(
        &self,
        pack: &str,
        existing: &mut HashSet<String>,
    ) -> Result<Vec<(String, BTreeMap<String, LayerSource>, BTreeMap<String, LayerSource>)>, DiscoveryError>
    {
        let mut results = Vec::new();
        for (kind, pack_root) in &self.pack_roots {
            let new_map = self.scan_pack_new(pack_root, pack, kind)?;
            for (name, src) in &new_map {
                if existing.contains(name) {
                    return Err(DiscoveryError::Shadowing {
                        layer: src.layer.clone(),
                        content_type: self.content_type.clone(),
                        id: name.clone(),
                        path: src.path.clone(),
                    });
                }
            }
            existing.extend(new_map.keys().cloned());

            let over_map = self.scan_pack_overlays(pack_root, pack, kind)?;
            for (name, src) in &over_map {
                if !existing.contains(name) {
                    return Err(DiscoveryError::DanglingOverlay {
                        layer: src.layer.clone(),
                        content_type: self.content_type.clone(),
                        id: name.clone(),
                        path: src.path.clone(),
                    });
                }
            }
            results.push((kind.clone(), new_map, over_map));
        }
        Ok(results)
    }

    /// Discover new user-defined entities; errors if one shadows `existing`.
    pub fn discover_user_new(
        &self,
        existing: &HashSet<String>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let new_map = self.cached_new(&self.user_dir, "user", |c| &mut c.user_new)?;
        for (name, src) in &new_map {
            if existing.contains(name) {
                return Err(DiscoveryError::Shadowing {
                    layer: src.layer.clone(),
                    content_type: self.content_type.clone(),
                    id: name.clone(),
                    path: src.path.clone(),
                });
            }
        }
        Ok(new_map)
    }

    /// Discover user overlays; errors if one references a non-existent id.
    pub fn discover_user_overlays(
        &self,
        existing: &HashSet<String>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let over_map = self.cached_overlay(&self.user_dir, "user", |c| &mut c.user_overlay)?;
        for (name, src) in &over_map {
            if !existing.contains(name) {
                return Err(DiscoveryError::DanglingOverlay {
                    layer: src.layer.clone(),
                    content_type: self.content_type.clone(),
                    id: name.clone(),
                    path: src.path.clone(),
                });
            }
        }
        Ok(over_map)
    }

    /// Discover project overlays; errors if one references a non-existent id.
    pub fn discover_project_overlays(
        &self,
        existing: &HashSet<String>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let over_map =
            self.cached_overlay(&self.project_dir, "project", |c| &mut c.project_overlay)?;
        for (name, src) in &over_map {
            if !existing.contains(name) {
                return Err(DiscoveryError::DanglingOverlay {
                    layer: src.layer.clone(),
                    content_type: self.content_type.clone(),
                    id: name.clone(),
                    path: src.path.clone(),
                });
            }
        }
        Ok(over_map)
    }

    /// Discover new project-defined entities; errors if one shadows `existing`.
    pub fn discover_project_new(
        &self,
        existing: &HashSet<String>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let new_map = self.cached_new(&self.project_dir, "project", |c| &mut c.project_new)?;
        for (name, src) in &new_map {
            if existing.contains(name) {
                return Err(DiscoveryError::Shadowing {
                    layer: src.layer.clone(),
                    content_type: self.content_type.clone(),
                    id: name.clone(),
                    path: src.path.clone(),
                });
            }
        }
        Ok(new_map)
    }

    fn cached_new(
        &self,
        base: &Path,
        label: &str,
        slot: impl Fn(&mut DiscoveryCache) -> &mut Option<(BTreeMap<String, LayerSource>, u64)>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let key = mtime_key(base);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((entities, cached_key)) = slot(&mut cache) {
                if *cached_key == key {
                    return Ok(entities.clone());
                }
            }
        }
        let entities = self.scan_new(base, label)?;
        *slot(&mut self.cache.lock().unwrap_or_else(|e| e.into_inner())) =
            Some((entities.clone(), key));
        Ok(entities)
    }

    fn cached_overlay(
        &self,
        base: &Path,
        label: &str,
        slot: impl Fn(&mut DiscoveryCache) -> &mut Option<(BTreeMap<String, LayerSource>, u64)>,
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let key = mtime_key(base);
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((entities, cached_key)) = slot(&mut cache) {
                if *cached_key == key {
                    return Ok(entities.clone());
                }
            }
        }
        let entities = self.scan_overlays(base, label)?;
        *slot(&mut self.cache.lock().unwrap_or_else(|e| e.into_inner())) =
            Some((entities.clone(), key));
        Ok(entities)
    }

    /// Full discovery pipeline across all layers in precedence order,
    /// returning the final `id -> LayerSource` map (last overlay for a
    /// given id is the most specific; new-definition entries win initial
    /// placement). Packs are discovered for every `pack` name supplied.
    pub fn discover_all(
        &self,
        active_packs: &[String],
    ) -> Result<BTreeMap<String, LayerSource>, DiscoveryError> {
        let core = self.discover_core()?;
        let mut existing: HashSet<String> = core.keys().cloned().collect();
        let mut merged = core;

        for pack in active_packs {
            let layers = self.iter_pack_layers(pack, &mut existing)?;
            for (_, new_map, over_map) in layers {
                merged.extend(new_map);
                merged.extend(over_map);
            }
        }

        let user_new = self.discover_user_new(&existing)?;
        existing.extend(user_new.keys().cloned());
        merged.extend(user_new);

        let user_overlay = self.discover_user_overlays(&existing)?;
        merged.extend(user_overlay);

        let project_new = self.discover_project_new(&existing)?;
        existing.extend(project_new.keys().cloned());
        merged.extend(project_new);

        let project_overlay = self.discover_project_overlays(&existing)?;
        merged.extend(project_overlay);

        Ok(merged)
    }
}
