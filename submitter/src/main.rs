mod builder;
mod command;
mod config;
mod extract;
mod filelist;
mod sites;
mod transport;


use crate::{
    builder::{SubmissionBuilder, SubmitError, SubmitOptions},
    config::{Attributes, ConfigErrors, Environment, SubmitConfig},
    extract::ExtractError,
    filelist::FileListError,
    sites::{HostStrategy, SiteError, SiteRegistry, Sites},
    transport::{CondorTransport, DryRun, SchedulerTransport, TransportError},
};
use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Submit a cmsRun configuration to HTCondor from any known submit host
#[derive(Parser, Debug)]
#[command(version, about, subcommand_negates_reqs = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// configuration to run, a python config or a yaml/json manifest
    #[arg(required = true)]
    cfg: Option<PathBuf>,

    /// directory receiving the per-job output files
    #[arg(short, long, required = true)]
    output_dir: Option<PathBuf>,

    /// where run.sh, submit.json and the job logs go [default: ./logs/<cfg stem>]
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// number of jobs, required for configurations with an empty source
    #[arg(short, long)]
    num_jobs: Option<u32>,

    /// directory holding the input files, required for configurations with a pool source
    #[arg(short, long)]
    input_dir: Option<PathBuf>,

    /// requested memory per job [default: from the site table]
    #[arg(short, long)]
    memory: Option<String>,

    /// batch name shown by the scheduler [default: cfg stem]
    #[arg(short = 'b', long)]
    job_batch_name: Option<String>,

    /// extra submit attribute, overrides site defaults
    #[arg(short = 'a', long = "attribute", value_name = "KEY=VALUE", value_parser = parse_attribute)]
    attributes: Vec<(String, String)>,

    /// glob selecting input files by name [default: from the site table]
    #[arg(short, long, visible_alias = "pathname", global = true)]
    pattern: Option<String>,

    /// site table replacing the built-in one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// pretend to run on this host instead of the current one
    #[arg(long, global = true)]
    host: Option<String>,

    /// replace an existing log directory
    #[arg(long)]
    clean: bool,

    /// prepare everything but do not call the scheduler
    #[arg(short, long)]
    dry_run: bool,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the input files of a directory the way jobs at this site address them
    FileList {
        input_dir: PathBuf,

        /// never overwritten [default: ./filelist-<input dir name>.txt]
        #[arg(short, long)]
        output_file: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Site(#[from] SiteError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    FileList(#[from] FileListError),
    #[error("{0} is required")]
    MissingArgument(&'static str),
    #[error("Failed to resolve {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn parse_attribute(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}

fn absolute(path: &Path) -> Result<PathBuf, AppError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| AppError::Path {
            path: path.to_path_buf(),
            source,
        })
}

/// load the site table, apply `--pattern` and select the site of this host
fn resolve_site(args: &Args) -> Result<(SubmitConfig, Sites), AppError> {
    let mut config = SubmitConfig::load(args.config.as_deref())?;
    if let Some(ref pattern) = args.pattern {
        config.submit.pattern = pattern.clone();
    }

    let host = match args.host {
        Some(ref host) => host.clone(),
        None => sites::current_hostname()?,
    };
    let (site_name, site) = SiteRegistry::new(&config).resolve(&host)?;
    info!("Running on {host} through site {site_name} ({})", site.kind());

    Ok((config, site))
}

fn run(args: Args) -> Result<Option<u64>, AppError> {
    match args.command {
        Some(Command::FileList {
            ref input_dir,
            ref output_file,
        }) => {
            run_file_list(&args, input_dir, output_file.as_deref())?;
            Ok(None)
        }
        None => run_submit(&args),
    }
}

fn run_file_list(args: &Args, input_dir: &Path, output_file: Option<&Path>) -> Result<(), AppError> {
    let (config, site) = resolve_site(args)?;
    let pattern = config.compile_pattern()?;

    let input_dir = absolute(input_dir)?;
    let output = match output_file {
        Some(output) => absolute(output)?,
        None => filelist::default_output(&absolute(Path::new("."))?, &input_dir),
    };

    filelist::write_file_list(&site, &input_dir, &pattern, &output)?;

    Ok(())
}

fn run_submit(args: &Args) -> Result<Option<u64>, AppError> {
    let cfg = args.cfg.as_deref().ok_or(AppError::MissingArgument("<CFG>"))?;
    let output_dir = args
        .output_dir
        .as_deref()
        .ok_or(AppError::MissingArgument("--output-dir"))?;

    // the site is settled before the configuration is touched
    let (config, site) = resolve_site(args)?;

    let config_file = cfg
        .canonicalize()
        .map_err(|_| ExtractError::ConfigNotFound(cfg.to_path_buf()))?;
    let facts = extract::extract(&config_file, config.submit.timeout())?;
    debug!(facts = ?facts, "Extracted job facts");

    let environment = Environment::from_env()?;

    let stem = config_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let log_dir = match args.log_dir {
        Some(ref log_dir) => absolute(log_dir)?,
        None => absolute(&Path::new("logs").join(stem))?,
    };

    let mut attributes: Attributes = config.submit.attributes.clone();
    for (name, value) in args.attributes.iter().cloned() {
        config::set_attribute(&mut attributes, name, value);
    }

    let options = SubmitOptions {
        config_file,
        output_dir: absolute(output_dir)?,
        log_dir,
        num_jobs: args.num_jobs,
        input_dir: args.input_dir.as_deref().map(absolute).transpose()?,
        memory: args.memory.clone().unwrap_or_else(|| config.submit.memory.clone()),
        job_batch_name: args.job_batch_name.clone(),
        attributes,
        clean: args.clean,
    };

    let pattern = config.compile_pattern()?;
    let submission = SubmissionBuilder::new(&environment, &config.submit, pattern).build(&facts, &site, &options)?;

    debug!(
        executable = ?submission.executable,
        descriptor = ?submission.descriptor_path,
        "Launching {}",
        submission.launch_arguments.join(" ")
    );

    let cluster = if args.dry_run {
        DryRun.submit(&submission)?
    } else {
        CondorTransport::new(config.submit.timeout()).submit(&submission)?
    };

    Ok(cluster)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(Some(cluster)) => {
            println!("{cluster}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}
