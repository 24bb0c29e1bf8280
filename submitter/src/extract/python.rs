use super::{ConfigGraph, ExtractError, Inspector};
use crate::command;
use std::{
    ffi::OsStr,
    fs,
    ops::Deref,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use tracing::{debug, error};

/// Evaluated inside a fresh interpreter: argv = [sandbox, module, graph file]
const INSPECT_SCRIPT: &str = r#"
import importlib
import json
import sys

sandbox, module_name, graph_path = sys.argv[1:4]
sys.path.insert(0, sandbox)
sys.argv = sys.argv[:1]

import FWCore.ParameterSet.Config as cms
from IOMC.RandomEngine.RandomServiceHelper import RandomNumberServiceHelper
from FWCore.ParameterSet.VarParsing import VarParsing


def find(owner, cls):
    found = []
    for name in dir(owner):
        if name.startswith('_'):
            continue
        value = getattr(owner, name)
        if isinstance(value, cls):
            found.append((name, value))
    return found


module = importlib.import_module(module_name)
process = module.process
source = getattr(process, 'source', None)

graph = {
    'source': None if source is None else {'type': source.type_()},
    'outputs': [
        {
            'label': name,
            'file_name': value.fileName.value() if hasattr(value, 'fileName') else None,
        }
        for name, value in find(process, cms.OutputModule)
    ],
    'random_seed_helper': len(find(module, RandomNumberServiceHelper)) > 0,
    'parameter_parser': len(find(module, VarParsing)) > 0,
}

with open(graph_path, 'w') as graph_file:
    json.dump(graph, graph_file)
"#;

/// Evaluates python configurations in a throw-away interpreter
#[derive(Debug, Clone)]
pub struct PythonInspector {
    pub interpreter: String,
    pub timeout: Duration,
}

impl PythonInspector {
    /// `python3` from the submitting shell, killed after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            interpreter: "python3".to_owned(),
            timeout,
        }
    }
}

impl Inspector for PythonInspector {
    #[tracing::instrument(level = "debug", skip(self))]
    fn inspect(&self, path: &Path) -> Result<ConfigGraph, ExtractError> {
        let sandbox = Sandbox::prepare(path)?;
        let graph_path = sandbox.join("graph.json");

        command::run(
            &self.interpreter,
            [
                OsStr::new("-c"),
                OsStr::new(INSPECT_SCRIPT),
                sandbox.as_os_str(),
                OsStr::new(&sandbox.module),
                graph_path.as_os_str(),
            ],
            self.timeout,
        )?;

        let graph = serde_json::from_str(&fs::read_to_string(&graph_path)?)?;

        Ok(graph)
    }
}

/// Temporary import path holding a sanitized copy of the configuration
/// The directory is removed on drop, regardless of how the inspection ended
#[derive(Debug)]
pub struct Sandbox {
    dir: Option<TempDir>,
    path: PathBuf,
    pub module: String,
}

impl Sandbox {
    pub fn prepare(config: &Path) -> Result<Self, ExtractError> {
        let content = fs::read_to_string(config)?;
        let module = module_name(config);
        let dir = tempfile::Builder::new().prefix("gem-submit-").tempdir()?;
        let path = dir.path().to_path_buf();

        fs::write(
            path.join(&module).with_extension("py"),
            strip_argument_parsing(&content),
        )?;

        debug!(sandbox = ?path, module = module.as_str(), "Prepared evaluation sandbox");

        Ok(Self {
            dir: Some(dir),
            path,
            module,
        })
    }
}

impl Deref for Sandbox {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!(sandbox = ?self.path, "Removed evaluation sandbox"),
                Err(error) => error!(error = ?error, "Failed to remove evaluation sandbox"),
            }
        }
    }
}

/// drop every line that would parse the real command line on import
pub fn strip_argument_parsing(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.contains("parseArguments"))
        .fold(String::with_capacity(content.len()), |mut init, line| {
            init.push_str(line);
            init.push('\n');

            init
        })
}

/// importable module name for a configuration file
pub fn module_name(config: &Path) -> String {
    let stem = config
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    stem.chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect()
}
