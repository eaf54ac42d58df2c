//! Section Parser & Registry (C7).
//!
//! Markers: `<!-- SECTION: name -->`...`<!-- /SECTION: name -->` and
//! `<!-- EXTEND: name -->`...`<!-- /EXTEND -->`, case-insensitive, with an
//! optional leading line-comment prefix (`#`, `//`, `--`, `;`). Grounded in
//! `composition/core/sections.py`: iterative marker stripping bounded at 50
//! passes, then collapsing 3+ blank lines to 2.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

const STRIP_MAX_PASSES: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionMode {
    Section,
    Extend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSection {
    pub name: String,
    pub mode: SectionMode,
    pub content: String,
    pub source_layer: String,
}

/// `{OPTIONAL_LINE_PREFIX}<!-- SECTION: name -->content<!-- /SECTION: name -->`,
/// case-insensitive, dot-matches-newline, allowing an optional leading
/// line-comment prefix before the marker.
const LINE_PREFIX: &str = r"(?:#|//|--|;)?[ \t]*";

static SECTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is){LINE_PREFIX}<!--\s*section:\s*([A-Za-z0-9._-]+)\s*-->(.*?){LINE_PREFIX}<!--\s*/section:\s*\1\s*-->"
    ))
    .expect("SECTION_PATTERN is a valid regex")
});

static EXTEND_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is){LINE_PREFIX}<!--\s*extend:\s*([A-Za-z0-9._-]+)\s*-->(.*?){LINE_PREFIX}<!--\s*/extend\s*-->"
    ))
    .expect("EXTEND_PATTERN is a valid regex")
});

static BLANK_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-run collapse regex is valid"));

static ANY_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is){LINE_PREFIX}<!--\s*/?(?:section|extend)(?::\s*[A-Za-z0-9._-]+\s*)?-->"
    ))
    .expect("ANY_MARKER is a valid regex")
});

/// Parse both `SECTION` and `EXTEND` markers out of `content`, in the order
/// they appear.
#[must_use]
pub fn parse(content: &str, source_layer: &str) -> Vec<ParsedSection> {
    let mut sections: Vec<(usize, ParsedSection)> = Vec::new();
    for caps in SECTION_PATTERN.captures_iter(content) {
        let m = caps.get(0).expect("whole match always present");
        sections.push((
            m.start(),
            ParsedSection {
                name: caps[1].to_owned(),
                mode: SectionMode::Section,
                content: caps[2].to_owned(),
                source_layer: source_layer.to_owned(),
            },
        ));
    }
    for caps in EXTEND_PATTERN.captures_iter(content) {
        let m = caps.get(0).expect("whole match always present");
        sections.push((
            m.start(),
            ParsedSection {
                name: caps[1].to_owned(),
                mode: SectionMode::Extend,
                content: caps[2].to_owned(),
                source_layer: source_layer.to_owned(),
            },
        ));
    }
    sections.sort_by_key(|(pos, _)| *pos);
    sections.into_iter().map(|(_, s)| s).collect()
}

/// Maps a section `name` to its base chunks (from `SECTION` definitions)
/// and extension chunks (from `EXTEND` blocks).
#[derive(Clone, Debug, Default)]
pub struct SectionRegistry {
    base: BTreeMap<String, Vec<String>>,
    extensions: BTreeMap<String, Vec<String>>,
    /// Insertion order of section names, for stable template substitution.
    order: Vec<String>,
}

impl SectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, name: impl Into<String>, content: impl Into<String>) {
        let name = name.into();
        if !self.base.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.base.entry(name).or_default().push(content.into());
    }

    pub fn add_extension(&mut self, name: impl Into<String>, content: impl Into<String>) {
        let name = name.into();
        if !self.base.contains_key(&name) && !self.extensions.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.extensions.entry(name).or_default().push(content.into());
    }

    /// Section names in first-seen order.
    #[must_use]
    pub fn sections(&self) -> &[String] {
        &self.order
    }

    /// `join(base_chunks, "\n\n")`, followed by `"\n" + join(extensions, "\n\n")`
    /// if any extension exists.
    #[must_use]
    pub fn get_section_content(&self, name: &str) -> String {
        let base = self
            .base
            .get(name)
            .map(|chunks| chunks.join("\n\n"))
            .unwrap_or_default();
        match self.extensions.get(name) {
            Some(ext_chunks) if !ext_chunks.is_empty() => {
                format!("{base}\n{}", ext_chunks.join("\n\n"))
            }
            _ => base,
        }
    }

    #[must_use]
    pub fn has_base(&self, name: &str) -> bool {
        self.base.contains_key(name)
    }
}

/// Extract a single named section's composed content without consulting a
/// registry — parses `content` directly for a `SECTION: name` block.
#[must_use]
pub fn extract_section(content: &str, name: &str) -> Option<String> {
    parse(content, "")
        .into_iter()
        .find(|s| s.mode == SectionMode::Section && s.name == name)
        .map(|s| s.content)
}

/// Iteratively strip all section/extend markers until the text is stable
/// (bounded at 50 passes to tolerate nesting), then collapse runs of 3+
/// newlines to 2.
#[must_use]
pub fn strip_markers(content: &str) -> String {
    let mut current = content.to_owned();
    for _ in 0..STRIP_MAX_PASSES {
        let stripped = strip_markers_once(&current);
        if stripped == current {
            break;
        }
        current = stripped;
    }
    BLANK_RUN.replace_all(&current, "\n\n").trim().to_owned()
}

fn strip_markers_once(content: &str) -> String {
    ANY_MARKER.replace_all(content, "").into_owned()
}
