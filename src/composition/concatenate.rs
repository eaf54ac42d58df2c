//! Concatenate composition strategy: plain layer concatenation with
//! dedupe applied layer-by-layer in the *opposite* direction from
//! Markdown's paragraph-based pass — project first (highest priority,
//! claims shingles), then packs in reverse order, then core — so common
//! boilerplate introduced by core gets squeezed out in favor of the more
//! specific layers that repeat it.

use crate::config::CompositionConfig;
use crate::template::TemplateError;

use super::{dedupe, CompositionContext, LayerContent};

pub fn compose(
    layers: &[LayerContent],
    config: &CompositionConfig,
    context: &CompositionContext,
) -> Result<String, TemplateError> {
    let kept: Vec<&LayerContent> = layers.iter().filter(|l| !l.content.trim().is_empty()).collect();

    let mut result = if config.enable_dedupe {
        dedupe_layers(&kept, config.dedupe_shingle_size)
    } else {
        kept.iter()
            .map(|l| l.content.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    if config.enable_template_processing {
        let vars = context.context_vars(layers);
        let (rendered, _diagnostics) = crate::template::render(&result, &vars, &context.render_options)?;
        result = rendered;
    }

    Ok(result)
}

/// `kept` is in precedence order (core first, project last). Dedupe must
/// process project-first, so we reverse before scoring and map the mask
/// back onto the original (core-first) ordering to preserve document order
/// in the output.
fn dedupe_layers(kept: &[&LayerContent], k: usize) -> String {
    let priority_order: Vec<&str> = kept.iter().rev().map(|l| l.content.trim()).collect();
    let mask = dedupe::priority_keep_mask(&priority_order, k);

    let mut keep_by_original_index = vec![false; kept.len()];
    for (priority_idx, keep) in mask.into_iter().enumerate() {
        let original_idx = kept.len() - 1 - priority_idx;
        keep_by_original_index[original_idx] = keep;
    }

    kept.iter()
        .zip(keep_by_original_index)
        .filter_map(|(l, keep)| keep.then(|| l.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
