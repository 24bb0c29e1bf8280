pub mod manifest;
pub mod python;


use crate::command::CommandError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Configuration {0} not found")]
    ConfigNotFound(PathBuf),
    #[error("Got unexpected source type: {0}")]
    UnsupportedSourceKind(String),
    #[error("No output module declared in {0}")]
    OutputFileNotFound(PathBuf),
    #[error("Output file {0} is not a usable file name")]
    InvalidOutputFile(String),
    #[error("Output file {0} points to remote storage, only local outputs can be transferred")]
    RemoteOutputFile(String),
    #[error("{0} uses an empty source but configures no random seed helper")]
    MissingRandomSeedConfiguration(PathBuf),
    #[error("{0} uses a pool source but declares no overridable input file parameter")]
    MissingParameterInjectionPoint(PathBuf),
    #[error("Don't know how to inspect {0}, expected a .py, .yaml, .yml or .json file")]
    UnsupportedArtifact(PathBuf),
    #[error("Failed to prepare the evaluation sandbox")]
    Sandbox(#[from] std::io::Error),
    #[error("Failed to evaluate the configuration")]
    Evaluation(#[from] CommandError),
    #[error("Failed to read the object graph of the configuration")]
    Graph(#[from] serde_json::Error),
    #[error("Failed to read the configuration manifest")]
    Manifest(#[from] serde_yaml::Error),
}

/// Where the events of a job come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// events are generated inside the job, only a job count is needed
    Empty,
    /// events are read from input files, one job per file
    Pooled,
}

impl FromStr for SourceKind {
    type Err = ExtractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "EmptySource" | "Empty" => Ok(Self::Empty),
            "PoolSource" | "Pooled" => Ok(Self::Pooled),
            other => Err(ExtractError::UnsupportedSourceKind(other.to_owned())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "EmptySource"),
            Self::Pooled => write!(f, "PoolSource"),
        }
    }
}

/// The two facts a submission needs from a configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFacts {
    pub source_kind: SourceKind,
    /// bare file name without scheme or directories
    pub output_file_name: String,
}

/// Declarative view of a configuration, as reported by an `Inspector`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigGraph {
    #[serde(default)]
    pub source: Option<SourceDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    /// a per-job random seed helper is configured
    #[serde(default)]
    pub random_seed_helper: bool,
    /// a command line parameter parser (e.g. `inputFiles=`) is present
    #[serde(default)]
    pub parameter_parser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDecl {
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDecl {
    pub label: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Loads the object graph of a configuration artifact
pub trait Inspector {
    fn inspect(&self, path: &Path) -> Result<ConfigGraph, ExtractError>;
}

/// Pick the inspector matching the file extension of `path`
/// python configurations are evaluated with `timeout`
pub fn inspector_for(path: &Path, timeout: Duration) -> Result<Box<dyn Inspector>, ExtractError> {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some("py") => Ok(Box::new(python::PythonInspector::new(timeout))),
        Some("yaml" | "yml" | "json") => Ok(Box::new(manifest::ManifestInspector)),
        _ => Err(ExtractError::UnsupportedArtifact(path.to_path_buf())),
    }
}

/// Extract the job facts of the configuration at `path`
pub fn extract(path: &Path, timeout: Duration) -> Result<JobFacts, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::ConfigNotFound(path.to_path_buf()));
    }

    extract_with(inspector_for(path, timeout)?.as_ref(), path)
}

#[tracing::instrument(level = "debug", skip(inspector))]
pub fn extract_with(inspector: &dyn Inspector, path: &Path) -> Result<JobFacts, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::ConfigNotFound(path.to_path_buf()));
    }

    let graph = inspector.inspect(path)?;
    debug!(graph = ?graph, "Inspected configuration");

    let source_kind = match graph.source {
        Some(ref source) => source.type_name.parse::<SourceKind>()?,
        None => return Err(ExtractError::UnsupportedSourceKind("<none>".to_owned())),
    };

    let output = first_output(&graph.outputs)
        .ok_or_else(|| ExtractError::OutputFileNotFound(path.to_path_buf()))?;
    let declared = output
        .file_name
        .as_deref()
        .ok_or_else(|| ExtractError::OutputFileNotFound(path.to_path_buf()))?;
    let output_file_name = normalize_output(declared)?;

    match source_kind {
        SourceKind::Empty if !graph.random_seed_helper => {
            return Err(ExtractError::MissingRandomSeedConfiguration(
                path.to_path_buf(),
            ))
        }
        SourceKind::Pooled if !graph.parameter_parser => {
            return Err(ExtractError::MissingParameterInjectionPoint(
                path.to_path_buf(),
            ))
        }
        _ => {}
    }

    info!(
        source = %source_kind,
        output = output_file_name.as_str(),
        "Extracted job facts from {}",
        path.display()
    );

    Ok(JobFacts {
        source_kind,
        output_file_name,
    })
}

/// first output module by label, warns if there is more than one
fn first_output(outputs: &[OutputDecl]) -> Option<&OutputDecl> {
    let first = outputs.iter().min_by(|a, b| a.label.cmp(&b.label))?;

    if outputs.len() > 1 {
        warn!(
            "Found {} output modules. Using the first one ({})",
            outputs.len(),
            first.label
        );
    }

    Some(first)
}

/// Reduce a declared output file to the bare file name the job will produce
pub fn normalize_output(declared: &str) -> Result<String, ExtractError> {
    let path = strip_file_scheme(declared.trim());

    if let Some((scheme, _)) = path.split_once("://") {
        if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
            return Err(ExtractError::RemoteOutputFile(declared.to_owned()));
        }
    }

    let name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(strip_file_scheme)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ExtractError::InvalidOutputFile(declared.to_owned()))?;

    if name != path {
        warn!("Output file {declared} contains directories, the job writes {name} instead");
    }

    Ok(name.to_owned())
}

fn strip_file_scheme(mut value: &str) -> &str {
    while let Some(rest) = value.strip_prefix("file:") {
        value = rest;
    }

    value
}
