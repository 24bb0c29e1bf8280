pub mod hdfs;
pub mod local;
pub mod xrootd;

#[cfg(test)]
mod sites_test;

use crate::{
    command::CommandError,
    config::{Attributes, SiteConfig, SubmitConfig},
};
use globset::GlobMatcher;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// scheduler macro expanding to the index of a job inside its cluster
pub const PROC_ID: &str = "$(ProcId)";

#[derive(Error, Debug)]
pub enum SiteError {
    #[error("Host {0} is not registered for any site")]
    UnknownSite(String),
    #[error("Site {site} does not support {operation} for {path}")]
    SiteOperationUnsupported {
        site: &'static str,
        operation: &'static str,
        path: PathBuf,
    },
    #[error("Input directory {0} is not a directory")]
    InputDirectory(PathBuf),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Storage backend failed")]
    Backend(#[from] CommandError),
    #[error("Failed to determine the hostname")]
    Hostname(#[from] nix::Error),
}

impl SiteError {
    pub fn unsupported(site: &'static str, operation: &'static str, path: &Path) -> Self {
        Self::SiteOperationUnsupported {
            site,
            operation,
            path: path.to_path_buf(),
        }
    }
}

/// One row of per-job substitution data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDatum {
    #[serde(rename = "inputFile")]
    pub input_file: String,
    /// placement hints, summed into a single rank expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<Vec<String>>,
}

impl ItemDatum {
    pub fn new(input_file: String) -> Self {
        Self {
            input_file,
            rank: None,
        }
    }

    pub fn rank_expression(&self) -> Option<String> {
        self.rank
            .as_ref()
            .filter(|rank| !rank.is_empty())
            .map(|rank| rank.join(" + "))
    }
}

/// Everything that differs between execution sites
pub trait HostStrategy {
    /// name of the site kind, used in logs and errors
    fn kind(&self) -> &'static str;

    /// Create `path` and all parents, succeeding if it already exists
    fn ensure_output_directory(&self, path: &Path) -> Result<(), SiteError>;

    /// List the input files in `input_dir` matching `pattern`, addressed the way jobs read them
    fn enumerate_inputs(
        &self,
        input_dir: &Path,
        pattern: &GlobMatcher,
    ) -> Result<Vec<ItemDatum>, SiteError>;

    /// Shell command moving `output_file` into `destination`, one file per job
    fn output_transfer_command(
        &self,
        output_file: &str,
        destination: &Path,
    ) -> Result<String, SiteError>;

    /// Scheduler attributes only needed at this site
    fn site_attributes(&self, input_dir: Option<&Path>) -> Result<Attributes, SiteError>;
}

/// All supported sites
/// These should be initialized from `SiteRegistry::resolve`
#[derive(Debug, Clone)]
pub enum Sites {
    Local(local::LocalSite),
    Xrootd(xrootd::XrootdSite),
    Hdfs(hdfs::HdfsSite),
}

impl Sites {
    pub fn load(config: &SiteConfig, timeout: Duration) -> Self {
        match config {
            SiteConfig::Local { attributes, .. } => Self::Local(local::LocalSite::new(attributes.clone())),
            SiteConfig::Xrootd {
                redirector,
                logical_prefix,
                store_prefix,
                attributes,
                ..
            } => Self::Xrootd(xrootd::XrootdSite::new(
                redirector.clone(),
                logical_prefix.clone(),
                store_prefix.clone(),
                attributes.clone(),
                xrootd::Xrdfs::new(redirector.clone(), timeout),
            )),
            SiteConfig::Hdfs {
                fuse_root,
                free_nodes,
                locality_weight,
                attributes,
                ..
            } => Self::Hdfs(hdfs::HdfsSite::new(
                fuse_root.clone(),
                free_nodes.clone(),
                *locality_weight,
                attributes.clone(),
                hdfs::HdfsCli::new(timeout),
            )),
        }
    }

    fn inner(&self) -> &dyn HostStrategy {
        match self {
            Self::Local(site) => site,
            Self::Xrootd(site) => site,
            Self::Hdfs(site) => site,
        }
    }
}

impl HostStrategy for Sites {
    fn kind(&self) -> &'static str {
        self.inner().kind()
    }

    fn ensure_output_directory(&self, path: &Path) -> Result<(), SiteError> {
        self.inner().ensure_output_directory(path)
    }

    fn enumerate_inputs(
        &self,
        input_dir: &Path,
        pattern: &GlobMatcher,
    ) -> Result<Vec<ItemDatum>, SiteError> {
        self.inner().enumerate_inputs(input_dir, pattern)
    }

    fn output_transfer_command(
        &self,
        output_file: &str,
        destination: &Path,
    ) -> Result<String, SiteError> {
        self.inner().output_transfer_command(output_file, destination)
    }

    fn site_attributes(&self, input_dir: Option<&Path>) -> Result<Attributes, SiteError> {
        self.inner().site_attributes(input_dir)
    }
}

/// Maps exact hostnames to the site serving them
#[derive(Debug, Clone)]
pub struct SiteRegistry {
    // (site name, hosts, config) in table order
    entries: Vec<(String, Vec<String>, SiteConfig)>,
    timeout: Duration,
}

impl SiteRegistry {
    pub fn new(config: &SubmitConfig) -> Self {
        Self {
            entries: config
                .sites
                .iter()
                .map(|(name, site)| (name.clone(), site.hosts().to_vec(), site.clone()))
                .collect_vec(),
            timeout: config.submit.timeout(),
        }
    }

    /// all registered hostnames
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|(_, hosts, _)| hosts.iter().map(String::as_str))
    }

    /// Select the site for `host`, there is no fallback host
    pub fn resolve(&self, host: &str) -> Result<(String, Sites), SiteError> {
        match self
            .entries
            .iter()
            .find(|(_, hosts, _)| hosts.iter().any(|known| known == host))
        {
            Some((name, _, config)) => {
                info!("Host {host} belongs to site {name} ({})", config.kind());

                Ok((name.clone(), Sites::load(config, self.timeout)))
            }
            None => {
                error!(
                    "Host {host} is not one of the registered hosts: {}",
                    self.hosts().join(", ")
                );

                Err(SiteError::UnknownSite(host.to_owned()))
            }
        }
    }
}

/// hostname of the submitting machine
pub fn current_hostname() -> Result<String, SiteError> {
    Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
}

/// `out.root` -> `out_$(ProcId).root`
pub fn per_job_file_name(output_file: &str) -> String {
    let path = Path::new(output_file);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();

    match path.extension() {
        Some(extension) => format!("{stem}_{PROC_ID}.{}", extension.to_string_lossy()),
        None => format!("{stem}_{PROC_ID}"),
    }
}

/// Swap the leading `from` of `path` for `to`
/// `/xrootd` is accepted for a `/xrootd/` prefix as well
pub fn replace_prefix(path: &Path, from: &str, to: &str) -> Option<String> {
    let path = path.to_string_lossy();

    if let Some(rest) = path.strip_prefix(from) {
        Some(format!("{to}{rest}"))
    } else if from.ends_with('/') && path == from.trim_end_matches('/') {
        Some(to.to_owned())
    } else {
        None
    }
}

/// Files directly inside `input_dir` whose name matches `pattern`, sorted by name
pub fn glob_inputs(input_dir: &Path, pattern: &GlobMatcher) -> Result<Vec<PathBuf>, SiteError> {
    if !input_dir.is_dir() {
        return Err(SiteError::InputDirectory(input_dir.to_path_buf()));
    }

    let mut builder = WalkBuilder::new(input_dir);
    builder
        .standard_filters(false)
        .max_depth(Some(1))
        .sort_by_file_name(|a, b| a.cmp(b));

    let paths = builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for inputs: {e}");
                None
            }
        })
        .filter(|entry| entry.depth() == 1)
        .filter(|entry| entry.file_type().map_or(false, |kind| !kind.is_dir()))
        .filter(|entry| pattern.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .collect_vec();

    debug!("Found {} input files in {}", paths.len(), input_dir.display());

    Ok(paths)
}
