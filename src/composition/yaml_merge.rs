//! YAML merge strategy (C8): deep-merge an ordered list of YAML layers,
//! serializing the result back without re-sorting keys.

use serde_yaml::Value;
use thiserror::Error;

use crate::config::deep_merge;

#[derive(Debug, Error)]
pub enum YamlMergeError {
    #[error("layer {index} is not valid YAML: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to serialize merged document: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// Deep-merge `layers` (each a raw YAML document string) in order — later
/// layers take precedence — and re-render as YAML text.
pub fn merge_yaml_layers(layers: &[String]) -> Result<String, YamlMergeError> {
    let mut merged = Value::Mapping(serde_yaml::Mapping::new());
    for (index, layer) in layers.iter().enumerate() {
        if layer.trim().is_empty() {
            continue;
        }
        let parsed: Value =
            serde_yaml::from_str(layer).map_err(|source| YamlMergeError::Parse { index, source })?;
        deep_merge(&mut merged, parsed);
    }
    serde_yaml::to_string(&merged).map_err(YamlMergeError::Serialize)
}
