//! Scenario 4 (spec §8): a pack providing a new (non-overlay) definition
//! for an id core already defines is a shadowing violation.

use std::fs;

use edison::discovery::{DiscoveryError, LayerDiscovery};
use tempfile::TempDir;

fn write(dir: &std::path::Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn pack_shadowing_a_core_definition_is_rejected() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "core/agents/reviewer.md", "core reviewer");
    write(tmp.path(), "packs/alpha/agents/reviewer.md", "pack reviewer");

    let discovery = LayerDiscovery::new(
        "agents",
        tmp.path().join("core"),
        vec![("packs".to_owned(), tmp.path().join("packs"))],
        tmp.path().join("user"),
        tmp.path().join("project"),
    );

    let core = discovery.discover_core().unwrap();
    let mut existing: std::collections::HashSet<String> = core.keys().cloned().collect();
    let err = discovery.iter_pack_layers("alpha", &mut existing).unwrap_err();

    assert!(matches!(err, DiscoveryError::Shadowing { ref id, .. } if id == "reviewer"));
}

#[test]
fn project_overlay_with_no_base_is_a_dangling_overlay() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "project/agents/overlays/ghost.md", "no base for this");

    let discovery = LayerDiscovery::new(
        "agents",
        tmp.path().join("core"),
        Vec::new(),
        tmp.path().join("user"),
        tmp.path().join("project"),
    );

    let existing = std::collections::HashSet::new();
    let err = discovery.discover_project_overlays(&existing).unwrap_err();
    assert!(matches!(err, DiscoveryError::DanglingOverlay { ref id, .. } if id == "ghost"));
}

#[test]
fn full_discovery_across_core_pack_and_project_layers() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "core/agents/reviewer.md", "core");
    write(tmp.path(), "packs/alpha/agents/tester.md", "pack");
    write(tmp.path(), "project/agents/custom.md", "project");
    write(tmp.path(), "project/agents/overlays/reviewer.md", "extension");

    let discovery = LayerDiscovery::new(
        "agents",
        tmp.path().join("core"),
        vec![("packs".to_owned(), tmp.path().join("packs"))],
        tmp.path().join("user"),
        tmp.path().join("project"),
    );

    let all = discovery.discover_all(&["alpha".to_owned()]).unwrap();
    assert!(all.contains_key("reviewer"));
    assert!(all.contains_key("tester"));
    assert!(all.contains_key("custom"));
    assert!(all.get("reviewer").unwrap().is_overlay);
}
