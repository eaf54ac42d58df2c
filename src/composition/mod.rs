//! Composition Strategy (C8): combine an ordered list of layer sources into
//! one rendered document. Three strategies share this module's
//! [`LayerContent`]/[`CompositionContext`] shapes: [`markdown`] (sections or
//! concatenation, then dedupe, then templates — a fixed pipeline order,
//! never reordered by configuration), [`concatenate`] (dedupe-only, applied
//! layer-by-layer in reverse precedence), and [`yaml_merge`] (deep-merge
//! typed config layers).

pub mod concatenate;
pub mod dedupe;
pub mod markdown;
pub mod yaml_merge;

use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{CompositionConfig, CompositionMode};
use crate::template::{IncludeProvider, RenderOptions, TemplateError};

/// One layer's raw content plus its provenance, in precedence order
/// (core first, project last).
#[derive(Clone, Debug)]
pub struct LayerContent {
    pub content: String,
    pub source: String,
    pub path: Option<PathBuf>,
}

/// Everything a composition pass needs beyond the ordered layer list:
/// the always-injected template variables, caller-supplied extras, and
/// the include machinery the Template Engine defers to.
pub struct CompositionContext {
    pub name: String,
    pub content_type: String,
    pub extra_vars: Map<String, Value>,
    pub render_options: RenderOptions,
}

impl CompositionContext {
    #[must_use]
    pub fn new(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            extra_vars: Map::new(),
            render_options: RenderOptions::default(),
        }
    }

    #[must_use]
    pub fn with_include_provider(mut self, provider: IncludeProvider) -> Self {
        self.render_options.include_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_include_root(mut self, root: PathBuf) -> Self {
        self.render_options.include_root = Some(root);
        self
    }

    fn context_vars(&self, layers: &[LayerContent]) -> Map<String, Value> {
        let source_layers = layers
            .iter()
            .map(|l| l.source.as_str())
            .collect::<Vec<_>>()
            .join(" + ");
        let mut vars = crate::template::base_context(
            &self.name,
            &self.content_type,
            &source_layers,
            "1",
            &self.name,
            "",
            "",
            "",
        );
        for (k, v) in &self.extra_vars {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    YamlMerge(#[from] yaml_merge::YamlMergeError),
}

/// Compose `layers` per `config`, dispatching on `config.composition_mode`.
/// This is the single entry point every content-type registry uses; the
/// fixed per-strategy pipeline order is enforced inside each strategy
/// module, never here.
pub fn compose(
    layers: &[LayerContent],
    config: &CompositionConfig,
    context: &CompositionContext,
) -> Result<String, CompositionError> {
    match config.composition_mode {
        CompositionMode::Section => Ok(markdown::compose(layers, config, context)?),
        CompositionMode::Concatenate => Ok(concatenate::compose(layers, config, context)?),
        CompositionMode::YamlMerge => {
            let raw: Vec<String> = layers.iter().map(|l| l.content.clone()).collect();
            Ok(yaml_merge::merge_yaml_layers(&raw)?)
        }
    }
}
