use super::{ConfigGraph, ExtractError, Inspector};
use std::{fs, path::Path};

/// Reads a configuration that is already described declaratively
///
/// ```yaml
/// source:
///   type: PoolSource
/// outputs:
///   - label: out
///     file_name: file:out.root
/// parameter_parser: true
/// ```
///
/// JSON is a subset of YAML, so `.json` manifests go through the same parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestInspector;

impl Inspector for ManifestInspector {
    fn inspect(&self, path: &Path) -> Result<ConfigGraph, ExtractError> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }
}
