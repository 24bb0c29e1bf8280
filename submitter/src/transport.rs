#[cfg(test)]
mod transport_test;

use crate::{
    builder::{AttrValue, Queue, Submission, SubmissionDescriptor},
    command::{self, CommandError},
};
use std::{
    ffi::OsStr,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Scheduler rejected the submission")]
    Command(#[from] CommandError),
    #[error("Unexpected answer from the scheduler: {0}")]
    UnexpectedOutput(String),
}

/// Hands a finished submission to the batch scheduler
pub trait SchedulerTransport {
    /// returns the cluster id, if the scheduler assigned one
    fn submit(&self, submission: &Submission) -> Result<Option<u64>, TransportError>;
}

/// Stops right before the scheduler, everything else has already been written
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRun;

impl SchedulerTransport for DryRun {
    fn submit(&self, submission: &Submission) -> Result<Option<u64>, TransportError> {
        info!(
            "Dry run: {} job(s) prepared in {}, nothing submitted",
            submission.descriptor.job_count(),
            submission.log_dir.display()
        );
        debug!("Wrapper script:\n{}", submission.wrapper_script);

        Ok(None)
    }
}

/// Submits through `condor_submit` with a generated submit file
#[derive(Debug, Clone)]
pub struct CondorTransport {
    timeout: Duration,
}

impl CondorTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SchedulerTransport for CondorTransport {
    fn submit(&self, submission: &Submission) -> Result<Option<u64>, TransportError> {
        let items_path = submission.log_dir.join("items.txt");
        let submit_path = submission.log_dir.join("submit.sub");

        let items_file = match render_items(&submission.descriptor) {
            Some(items) => {
                write(&items_path, &items)?;
                Some(items_path.as_path())
            }
            None => None,
        };
        write(&submit_path, &render_submit_file(&submission.descriptor, items_file))?;

        let output = command::run(
            "condor_submit",
            [OsStr::new("-terse"), submit_path.as_os_str()],
            self.timeout,
        )?;
        let cluster = parse_cluster_id(&output.stdout)?;

        info!(
            "{} job(s) submitted with cluster id {cluster}",
            submission.descriptor.job_count()
        );

        Ok(Some(cluster))
    }
}

fn write(path: &Path, content: &str) -> Result<(), TransportError> {
    fs::write(path, content).map_err(|source| TransportError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Wrote {}", path.display());

    Ok(())
}

/// Render the descriptor in submit file syntax, ending with the queue statement
pub fn render_submit_file(descriptor: &SubmissionDescriptor, items_file: Option<&Path>) -> String {
    let mut content = String::new();

    for (name, value) in descriptor.attributes.iter() {
        let _ = writeln!(content, "{name} = {}", render_value(name, value));
    }

    let _ = match (&descriptor.queue, items_file) {
        (Queue::Count(count), _) => writeln!(content, "queue {count}"),
        (Queue::ItemData(items), Some(path)) => {
            let variables = if items.iter().any(|item| item.rank_expression().is_some()) {
                "inputFile,rank"
            } else {
                "inputFile"
            };

            writeln!(content, "queue {variables} from {}", path.display())
        }
        (Queue::ItemData(items), None) => writeln!(content, "queue {}", items.len()),
    };

    content
}

/// one line per job, the rank expression takes the remainder of the line
pub fn render_items(descriptor: &SubmissionDescriptor) -> Option<String> {
    let items = descriptor.item_data()?;
    let with_rank = items.iter().any(|item| item.rank_expression().is_some());

    Some(items.iter().fold(String::new(), |mut init, item| {
        init.push_str(&item.input_file);
        if with_rank {
            init.push(',');
            init.push_str(&item.rank_expression().unwrap_or_else(|| "0".to_owned()));
        }
        init.push('\n');

        init
    }))
}

// custom `+` attributes are ClassAd expressions, plain words have to be quoted
fn render_value(name: &str, value: &AttrValue) -> String {
    let rendered = value.render();

    match value {
        AttrValue::Str(_) if name.starts_with('+') && !rendered.starts_with('"') => {
            format!("\"{rendered}\"")
        }
        _ => rendered,
    }
}

/// `condor_submit -terse` prints `<cluster>.<first proc> - <cluster>.<last proc>`
pub fn parse_cluster_id(output: &str) -> Result<u64, TransportError> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split('.').next())
        .and_then(|cluster| cluster.trim().parse().ok())
        .ok_or_else(|| TransportError::UnexpectedOutput(output.trim().to_owned()))
}
