
use globset::{GlobBuilder, GlobMatcher};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// built-in site table, used whenever no `--config` is given
pub const DEFAULT_SITES: &str = include_str!("../sites.yaml");

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read config file {0}")]
    ReadConfig(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Config contains {0} error(s), see the log above")]
    Preflight(usize),
    #[error("Environment variable {0} is not defined")]
    MissingEnvironment(&'static str),
}

/// Extra scheduler attributes, kept sorted for a stable submit description
pub type Attributes = BTreeMap<String, String>;

/// Set `name`, replacing a key that only differs in case
///
/// Submit file keys are case-insensitive and the last definition wins, so two spellings of
/// one key must never both end up in a submit description.
pub fn set_attribute<V>(attributes: &mut BTreeMap<String, V>, name: String, value: V) -> Option<V> {
    let previous = attributes
        .keys()
        .find(|key| key.eq_ignore_ascii_case(&name))
        .cloned()
        .and_then(|key| attributes.remove(&key));
    attributes.insert(name, value);

    previous
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    // execution sites, keyed by a human readable name
    pub sites: BTreeMap<String, SiteConfig>,
    #[serde(default)]
    pub submit: SubmitDefaults,
}

/// One execution site, the `kind` selects the host strategy
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum SiteConfig {
    Local {
        hosts: Vec<String>,
        #[serde(default)]
        attributes: Attributes,
    },
    Xrootd {
        hosts: Vec<String>,
        // e.g. root://cms-xrdr.private.lo:2094
        redirector: String,
        // prefix of the FUSE mount on the submit node
        #[serde(default = "default_logical_prefix")]
        logical_prefix: String,
        // the same directory as addressed by the xrootd server
        #[serde(default = "default_store_prefix")]
        store_prefix: String,
        #[serde(default)]
        attributes: Attributes,
    },
    Hdfs {
        hosts: Vec<String>,
        #[serde(default = "default_fuse_root")]
        fuse_root: String,
        // nodes without local data that may always run a job
        #[serde(default)]
        free_nodes: Vec<String>,
        #[serde(default = "default_locality_weight")]
        locality_weight: u32,
        #[serde(default)]
        attributes: Attributes,
    },
}

impl SiteConfig {
    pub fn hosts(&self) -> &[String] {
        match self {
            Self::Local { hosts, .. } | Self::Xrootd { hosts, .. } | Self::Hdfs { hosts, .. } => {
                hosts
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Xrootd { .. } => "xrootd",
            Self::Hdfs { .. } => "hdfs",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SubmitDefaults {
    // program launched by the wrapper script
    #[serde(default = "default_executable")]
    pub executable: String,
    // glob for input files inside the input directory
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    // caller attributes, these win over site attributes
    #[serde(default)]
    pub attributes: Attributes,
    // seconds an external storage/scheduler client may run
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for SubmitDefaults {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            pattern: default_pattern(),
            memory: default_memory(),
            attributes: Attributes::new(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl SubmitDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

impl SubmitConfig {
    /// load the site table from `path` or fall back to the built-in one
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        let config: Self = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .map_err(|error| ConfigErrors::ReadConfig(path.to_path_buf(), error))?;

                serde_yaml::from_str(&content)?
            }
            None => serde_yaml::from_str(DEFAULT_SITES)?,
        };

        match config.preflight_checks() {
            0 => Ok(config),
            errors => Err(ConfigErrors::Preflight(errors)),
        }
    }

    /// Compile the input glob
    pub fn compile_pattern(&self) -> Result<GlobMatcher, ConfigErrors> {
        Ok(GlobBuilder::new(&self.submit.pattern)
            .literal_separator(true)
            .build()?
            .compile_matcher())
    }

    /// Check the whole config and return the number of problems found
    pub fn preflight_checks(&self) -> usize {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut errors = 0;

        if self.sites.is_empty() {
            error!("No site was defined, unable to select a host strategy");
            errors += 1;
        }

        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();

        for (name, site) in self.sites.iter() {
            if site.hosts().is_empty() {
                error!("sites.{name}.hosts is empty, the site can never be selected");
                errors += 1;
            }

            let duplicates = site.hosts().iter().duplicates().join(", ");
            if !duplicates.is_empty() {
                warn!("sites.{name}.hosts lists {duplicates} more than once");
            }

            for host in site.hosts() {
                if let Some(other) = seen.insert(host.as_str(), name.as_str()) {
                    if other != name {
                        error!("Host {host} is registered by both sites.{other} and sites.{name}");
                        errors += 1;
                    }
                }
            }

            match site {
                SiteConfig::Xrootd {
                    redirector,
                    logical_prefix,
                    store_prefix,
                    ..
                } => {
                    if !redirector.starts_with("root://") {
                        error!("sites.{name}.redirector ({redirector}) must be a root:// url");
                        errors += 1;
                    }

                    for (field, prefix) in [("logical_prefix", logical_prefix), ("store_prefix", store_prefix)] {
                        if !(prefix.starts_with('/') && prefix.ends_with('/')) {
                            error!("sites.{name}.{field} ({prefix}) must start and end with '/'");
                            errors += 1;
                        }
                    }
                }
                SiteConfig::Hdfs {
                    fuse_root,
                    locality_weight,
                    ..
                } => {
                    if !fuse_root.starts_with('/') || fuse_root.ends_with('/') {
                        error!("sites.{name}.fuse_root ({fuse_root}) must be absolute without a trailing '/'");
                        errors += 1;
                    }

                    if *locality_weight == 0 {
                        error!("sites.{name}.locality_weight cannot be 0");
                        errors += 1;
                    }
                }
                SiteConfig::Local { .. } => {}
            }
        }

        if let Err(error) = self.compile_pattern() {
            error!("submit.pattern ({}) is not a valid glob: {error}", self.submit.pattern);
            errors += 1;
        }

        if self.submit.executable.trim().is_empty() {
            error!("submit.executable cannot be empty");
            errors += 1;
        }

        if self.submit.command_timeout == 0 {
            error!("submit.command_timeout cannot be 0");
            errors += 1;
        }

        errors
    }
}

/// Read-only facts about the software release of the submitting shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub scram_arch: String,
    pub cmssw_version: String,
    pub cmssw_base: Option<PathBuf>,
}

impl Environment {
    pub fn from_env() -> Result<Self, ConfigErrors> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigErrors>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or(ConfigErrors::MissingEnvironment(name))
        };

        Ok(Self {
            scram_arch: required("SCRAM_ARCH")?,
            cmssw_version: required("CMSSW_VERSION")?,
            cmssw_base: lookup("CMSSW_BASE").map(PathBuf::from),
        })
    }
}

fn default_logical_prefix() -> String {
    "/xrootd/".to_owned()
}

fn default_store_prefix() -> String {
    "/xrd/".to_owned()
}

fn default_fuse_root() -> String {
    "/hdfs".to_owned()
}

fn default_locality_weight() -> u32 {
    3
}

fn default_executable() -> String {
    "cmsRun".to_owned()
}

fn default_pattern() -> String {
    "*.root".to_owned()
}

fn default_memory() -> String {
    "1GB".to_owned()
}

fn default_command_timeout() -> u64 {
    120
}
