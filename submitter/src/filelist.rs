
use crate::sites::{HostStrategy, SiteError};
use globset::GlobMatcher;
use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum FileListError {
    #[error("File list {0} already exists")]
    Exists(PathBuf),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Site operation failed")]
    Site(#[from] SiteError),
}

/// `filelist-<input dir name>.txt` inside `dir`
pub fn default_output(dir: &Path, input_dir: &Path) -> PathBuf {
    let name = input_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    dir.join(format!("filelist-{name}.txt"))
}

/// Write the inputs of `input_dir`, addressed the way jobs at this site read them, one per line
///
/// An existing list is never overwritten.
pub fn write_file_list(
    strategy: &dyn HostStrategy,
    input_dir: &Path,
    pattern: &GlobMatcher,
    output: &Path,
) -> Result<usize, FileListError> {
    if output.exists() {
        return Err(FileListError::Exists(output.to_path_buf()));
    }

    let items = strategy.enumerate_inputs(input_dir, pattern)?;
    if items.is_empty() {
        warn!("No file in {} matches the input pattern", input_dir.display());
    }

    let content = items.iter().fold(String::new(), |mut init, item| {
        init.push_str(&item.input_file);
        init.push('\n');

        init
    });

    let failed = |source: std::io::Error| match source.kind() {
        ErrorKind::AlreadyExists => FileListError::Exists(output.to_path_buf()),
        _ => FileListError::Write {
            path: output.to_path_buf(),
            source,
        },
    };

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .and_then(|mut file| file.write_all(content.as_bytes()))
        .map_err(failed)?;

    info!("Wrote {} file(s) to {}", items.len(), output.display());

    Ok(items.len())
}
