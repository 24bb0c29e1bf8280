
use crate::{
    config::{set_attribute, Attributes, Environment, SubmitDefaults},
    extract::{JobFacts, SourceKind},
    sites::{HostStrategy, ItemDatum, SiteError, PROC_ID},
};
use globset::GlobMatcher;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::{Error, ErrorKind},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// shell variable holding the job index inside the wrapper script
const PROC_ID_VARIABLE: &str = "${PROC_ID}";

const WRAPPER_TEMPLATE: &str = r#"#!/bin/sh
################################################################################
# start
echo "start: $(date)"
echo "whoami: $(whoami)"
echo "hostname: $(hostname)"
echo "pwd: $(pwd)"
ls -lha ./

################################################################################
# setup, submitted with @CMSSW_VERSION@ (@SCRAM_ARCH@)
echo "SCRAM_ARCH: ${SCRAM_ARCH}"
echo "CMSSW_VERSION: ${CMSSW_VERSION}"
echo "CMSSW_BASE: ${CMSSW_BASE}"

################################################################################
# argument parsing
PROC_ID=${1}
shift 1
ARGS=${@}

echo "PROC_ID: ${PROC_ID}"
echo "ARGS: ${ARGS}"

################################################################################
# run
@EXECUTABLE@ ${ARGS}
STATUS=${?}
if [ ${STATUS} -ne 0 ]; then
    echo "@EXECUTABLE@ failed with exit code ${STATUS}"
    exit ${STATUS}
fi

################################################################################
# transfer output files
@OUTPUT_TRANSFER_CMD@

rm -vf @OUTPUT_FILE@

################################################################################
# terminate
echo "end: $(date)"
"#;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("The configuration uses an empty source, the number of jobs is required")]
    MissingJobCount,
    #[error("The configuration uses a pool source, an input directory is required")]
    MissingInputDirectory,
    #[error("Refusing to submit zero jobs: {0}")]
    ZeroJobs(String),
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreate { path: PathBuf, source: Error },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: Error },
    #[error("Refusing to clean {log_dir}, it contains {path}")]
    CleanWouldRemove { log_dir: PathBuf, path: PathBuf },
    #[error("Site operation failed")]
    Site(#[from] SiteError),
    #[error("Failed to serialize the submit description")]
    Serialize(#[from] serde_json::Error),
}

/// A single scheduler attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(u64),
    Str(String),
    List(Vec<String>),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl AttrValue {
    /// value as written into a submit file
    pub fn render(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Str(value) => value.clone(),
            Self::List(values) => values.join(", "),
        }
    }
}

/// How many jobs are queued, either a plain count or one job per item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Count(u32),
    ItemData(Vec<ItemDatum>),
}

/// Scheduler agnostic description of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionDescriptor {
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttrValue>,
    pub queue: Queue,
}

impl SubmissionDescriptor {
    pub fn job_count(&self) -> usize {
        match &self.queue {
            Queue::Count(count) => *count as usize,
            Queue::ItemData(items) => items.len(),
        }
    }

    pub fn item_data(&self) -> Option<&[ItemDatum]> {
        match &self.queue {
            Queue::Count(_) => None,
            Queue::ItemData(items) => Some(items),
        }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }
}

/// What the caller asks for, as given on the command line
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub config_file: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub num_jobs: Option<u32>,
    pub input_dir: Option<PathBuf>,
    pub memory: String,
    pub job_batch_name: Option<String>,
    /// explicit attributes, never overridden by site defaults
    pub attributes: Attributes,
    /// replace an existing log directory
    pub clean: bool,
}

/// Result of a build, already persisted in `log_dir`
#[derive(Debug, Clone)]
pub struct Submission {
    pub wrapper_script: String,
    pub descriptor: SubmissionDescriptor,
    /// arguments of the launched executable
    pub launch_arguments: Vec<String>,
    pub log_dir: PathBuf,
    pub executable: PathBuf,
    pub descriptor_path: PathBuf,
}

pub struct SubmissionBuilder<'a> {
    environment: &'a Environment,
    defaults: &'a SubmitDefaults,
    pattern: GlobMatcher,
}

impl<'a> SubmissionBuilder<'a> {
    pub fn new(environment: &'a Environment, defaults: &'a SubmitDefaults, pattern: GlobMatcher) -> Self {
        Self {
            environment,
            defaults,
            pattern,
        }
    }

    /// Build the wrapper script and the descriptor and persist both in the log directory
    #[instrument(skip_all, level = "info")]
    pub fn build(
        &self,
        facts: &JobFacts,
        strategy: &dyn HostStrategy,
        options: &SubmitOptions,
    ) -> Result<Submission, SubmitError> {
        let config_name = options
            .config_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // inputs first, nothing is created for a submission that would be rejected
        let (queue, launch_arguments, job_type) = match facts.source_kind {
            SourceKind::Empty => match options.num_jobs {
                None => return Err(SubmitError::MissingJobCount),
                Some(0) => return Err(SubmitError::ZeroJobs("--num-jobs is 0".to_owned())),
                Some(count) => (Queue::Count(count), vec![config_name], "MC"),
            },
            SourceKind::Pooled => {
                let input_dir = options
                    .input_dir
                    .as_deref()
                    .ok_or(SubmitError::MissingInputDirectory)?;
                let items = strategy.enumerate_inputs(input_dir, &self.pattern)?;

                if items.is_empty() {
                    return Err(SubmitError::ZeroJobs(format!(
                        "no file in {} matches {}",
                        input_dir.display(),
                        self.defaults.pattern
                    )));
                }
                info!("Queueing one job per input file ({} files)", items.len());

                (
                    Queue::ItemData(items),
                    vec![config_name, "inputFiles=$(inputFile)".to_owned()],
                    "Analysis",
                )
            }
        };

        let transfer = strategy.output_transfer_command(&facts.output_file_name, &options.output_dir)?;
        let site_attributes = strategy.site_attributes(options.input_dir.as_deref())?;

        // local checks before any storage operation
        check_log_dir(options)?;
        strategy.ensure_output_directory(&options.output_dir)?;
        prepare_log_dir(&options.log_dir, options.clean)?;

        let wrapper_script = self.render_wrapper(&transfer, &facts.output_file_name);
        let executable = options.log_dir.join("run.sh");
        write_executable(&executable, &wrapper_script)?;

        let mut attributes = BTreeMap::new();
        for (name, value) in [
            ("universe", "vanilla"),
            ("getenv", "True"),
            ("should_transfer_files", "YES"),
            ("when_to_transfer_output", "ON_EXIT"),
        ] {
            attributes.insert(name.to_owned(), AttrValue::from(value));
        }

        let arguments = std::iter::once(PROC_ID.to_owned())
            .chain(launch_arguments.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let job_batch_name = options.job_batch_name.clone().unwrap_or_else(|| {
            options
                .config_file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        for (name, value) in [
            ("executable", AttrValue::from(executable.to_string_lossy().into_owned())),
            ("arguments", AttrValue::from(arguments)),
            (
                "transfer_input_files",
                AttrValue::List(vec![options.config_file.to_string_lossy().into_owned()]),
            ),
            ("JobBatchName", AttrValue::from(job_batch_name)),
            ("log", log_path(&options.log_dir, "condor.log")),
            ("output", log_path(&options.log_dir, &format!("job_{PROC_ID}.out"))),
            ("error", log_path(&options.log_dir, &format!("job_{PROC_ID}.err"))),
            ("request_memory", AttrValue::from(options.memory.clone())),
            ("+Tag", AttrValue::from(env!("CARGO_PKG_NAME"))),
            ("+JobType", AttrValue::from(job_type)),
        ] {
            attributes.insert(name.to_owned(), value);
        }

        // site defaults first, explicit caller attributes always win
        for (name, value) in site_attributes {
            set_attribute(&mut attributes, name, AttrValue::from(value));
        }
        for (name, value) in options.attributes.iter() {
            if let Some(previous) = set_attribute(&mut attributes, name.clone(), AttrValue::from(value.clone())) {
                debug!("Caller overrides {name} (was {})", previous.render());
            }
        }

        let descriptor = SubmissionDescriptor { attributes, queue };
        let descriptor_path = options.log_dir.join("submit.json");
        let json = serde_json::to_string_pretty(&descriptor)?;
        fs::write(&descriptor_path, json).map_err(|source| SubmitError::Write {
            path: descriptor_path.clone(),
            source,
        })?;

        info!(
            jobs = descriptor.job_count(),
            site = strategy.kind(),
            "Prepared submission in {}",
            options.log_dir.display()
        );

        Ok(Submission {
            wrapper_script,
            descriptor,
            launch_arguments,
            log_dir: options.log_dir.clone(),
            executable,
            descriptor_path,
        })
    }

    /// Fill the wrapper template, the job index arrives as the first script argument
    pub fn render_wrapper(&self, output_transfer_cmd: &str, output_file: &str) -> String {
        WRAPPER_TEMPLATE
            .replace("@CMSSW_VERSION@", &self.environment.cmssw_version)
            .replace("@SCRAM_ARCH@", &self.environment.scram_arch)
            .replace("@EXECUTABLE@", &self.defaults.executable)
            .replace(
                "@OUTPUT_TRANSFER_CMD@",
                &output_transfer_cmd.replace(PROC_ID, PROC_ID_VARIABLE),
            )
            .replace("@OUTPUT_FILE@", output_file)
    }
}

fn log_path(log_dir: &Path, name: &str) -> AttrValue {
    AttrValue::from(log_dir.join(name).to_string_lossy().into_owned())
}

fn log_dir_exists(path: &Path) -> SubmitError {
    SubmitError::DirectoryCreate {
        path: path.to_path_buf(),
        source: Error::new(
            ErrorKind::AlreadyExists,
            "already exists, pass --clean to replace it",
        ),
    }
}

/// An existing log directory needs `clean`, and cleaning must not remove anything the submission uses
pub fn check_log_dir(options: &SubmitOptions) -> Result<(), SubmitError> {
    let log_dir = &options.log_dir;
    if !log_dir.exists() {
        return Ok(());
    }
    if !options.clean {
        return Err(log_dir_exists(log_dir));
    }

    let used = [
        Some(options.output_dir.as_path()),
        options.input_dir.as_deref(),
        Some(options.config_file.as_path()),
    ];
    match used.into_iter().flatten().find(|path| path.starts_with(log_dir)) {
        Some(path) => Err(SubmitError::CleanWouldRemove {
            log_dir: log_dir.clone(),
            path: path.to_path_buf(),
        }),
        None => Ok(()),
    }
}

/// Create a fresh log directory, an existing one is only replaced with `clean`
pub fn prepare_log_dir(path: &Path, clean: bool) -> Result<(), SubmitError> {
    let failed = |source| SubmitError::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        if !clean {
            return Err(log_dir_exists(path));
        }

        fs::remove_dir_all(path).map_err(failed)?;
        info!("Removed previous log directory {}", path.display());
    }

    fs::create_dir_all(path).map_err(failed)?;
    debug!("mkdir: created directory '{}'", path.display());

    Ok(())
}

fn write_executable(path: &Path, content: &str) -> Result<(), SubmitError> {
    let failed = |source| SubmitError::Write {
        path: path.to_path_buf(),
        source,
    };

    fs::write(path, content).map_err(failed)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(failed)?;
    debug!("executable: {} (0755)", path.display());

    Ok(())
}
