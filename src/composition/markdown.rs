//! Markdown composition strategy: the unified pipeline for every markdown
//! content type (agents, validators, guidelines, constitutions, documents).
//!
//! Mirrors `composition/strategies/markdown.py`'s fixed pipeline: sections
//! (or plain concatenation) → dedupe → templates. The order never changes
//! regardless of which steps are individually enabled.

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

use edison_core::section::{parse as parse_sections, strip_markers};
use edison_core::{ParsedSection, SectionMode, SectionRegistry};

use crate::config::CompositionConfig;
use crate::template::TemplateError;

use super::{dedupe, CompositionContext, LayerContent};

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-run regex is valid"));

pub fn compose(
    layers: &[LayerContent],
    config: &CompositionConfig,
    context: &CompositionContext,
) -> Result<String, TemplateError> {
    if layers.is_empty() {
        return Ok(String::new());
    }

    let mut result = if config.enable_sections {
        compose_sections(layers)
    } else {
        concatenate_plain(layers)
    };

    if config.enable_dedupe {
        result = dedupe::dedupe_by_shingles(&result, config.dedupe_shingle_size);
    }

    if config.enable_template_processing {
        let vars = context.context_vars(layers);
        let (rendered, _diagnostics) = crate::template::render(&result, &vars, &context.render_options)?;
        result = rendered;
    }

    Ok(result)
}

fn compose_sections(layers: &[LayerContent]) -> String {
    let template_layer = &layers[0];
    let mut registry = SectionRegistry::new();

    for section in parse_sections(&template_layer.content, &template_layer.source) {
        if section.mode == SectionMode::Section {
            registry.add_section(section.name, section.content);
        }
    }

    for layer in &layers[1..] {
        for section in parse_sections(&layer.content, &layer.source) {
            apply_overlay_section(&mut registry, section);
        }
    }

    let applied = apply_sections(&template_layer.content, &registry);
    strip_markers(&applied)
}

fn apply_overlay_section(registry: &mut SectionRegistry, section: ParsedSection) {
    match section.mode {
        SectionMode::Extend => registry.add_extension(section.name, section.content),
        SectionMode::Section => {
            if !registry.has_base(&section.name) {
                registry.add_section(section.name, section.content);
            }
        }
    }
}

fn apply_sections(template: &str, registry: &SectionRegistry) -> String {
    let mut result = template.to_owned();
    for name in registry.sections() {
        let content = registry.get_section_content(name);
        let escaped = regex::escape(name);
        let pattern = Regex::new(&format!(
            r"(?is)<!--\s*section:\s*{escaped}\s*-->.*?<!--\s*/section:\s*{escaped}\s*-->"
        ))
        .expect("per-section replace pattern is valid");
        result = pattern.replace(&result, NoExpand(&content)).into_owned();
    }
    BLANK_RUN.replace_all(&result, "\n\n").trim().to_owned()
}

fn concatenate_plain(layers: &[LayerContent]) -> String {
    layers
        .iter()
        .map(|l| l.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(content: &str, source: &str) -> LayerContent {
        LayerContent {
            content: content.to_owned(),
            source: source.to_owned(),
            path: None,
        }
    }

    fn config() -> CompositionConfig {
        let mut c = CompositionConfig::default();
        c.enable_template_processing = false;
        c
    }

    #[test]
    fn section_overlay_extends_a_base_section() {
        let layers = vec![
            layer(
                "<!-- SECTION: body -->base text<!-- /SECTION: body -->",
                "core",
            ),
            layer("<!-- EXTEND: body -->extra text<!-- /EXTEND -->", "project"),
        ];
        let context = CompositionContext::new("agent", "agents");
        let result = compose(&layers, &config(), &context).unwrap();
        assert_eq!(result, "base text\nextra text");
    }

    #[test]
    fn overlay_cannot_override_a_base_section() {
        let layers = vec![
            layer(
                "<!-- SECTION: body -->base text<!-- /SECTION: body -->",
                "core",
            ),
            layer(
                "<!-- SECTION: body -->attempted override<!-- /SECTION: body -->",
                "project",
            ),
        ];
        let context = CompositionContext::new("agent", "agents");
        let result = compose(&layers, &config(), &context).unwrap();
        assert_eq!(result, "base text");
    }

    #[test]
    fn disabled_sections_fall_back_to_concatenation() {
        let mut cfg = config();
        cfg.enable_sections = false;
        let layers = vec![layer("first", "core"), layer("second", "project")];
        let context = CompositionContext::new("agent", "agents");
        let result = compose(&layers, &cfg, &context).unwrap();
        assert_eq!(result, "first\n\nsecond");
    }

    #[test]
    fn dedupe_runs_after_section_composition() {
        let mut cfg = config();
        cfg.enable_dedupe = true;
        cfg.dedupe_shingle_size = 3;
        let layers = vec![
            layer(
                "<!-- SECTION: body -->shared duplicated boilerplate line<!-- /SECTION: body -->",
                "core",
            ),
            layer(
                "<!-- EXTEND: body -->shared duplicated boilerplate line<!-- /EXTEND -->",
                "project",
            ),
        ];
        let context = CompositionContext::new("agent", "agents");
        let result = compose(&layers, &cfg, &context).unwrap();
        assert_eq!(result.matches("shared duplicated boilerplate line").count(), 1);
    }

    #[test]
    fn template_processing_runs_last() {
        let mut cfg = config();
        cfg.enable_template_processing = true;
        let layers = vec![layer(
            "<!-- SECTION: body -->hello {{name}}<!-- /SECTION: body -->",
            "core",
        )];
        let mut context = CompositionContext::new("widget", "agents");
        context.extra_vars.insert("name".into(), "widget".into());
        let result = compose(&layers, &cfg, &context).unwrap();
        assert_eq!(result, "hello widget");
    }
}
