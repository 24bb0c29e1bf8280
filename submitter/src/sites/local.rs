use super::{glob_inputs, per_job_file_name, HostStrategy, ItemDatum, SiteError};
use crate::config::Attributes;
use globset::GlobMatcher;
use std::{fs, path::Path};
use tracing::{debug, info};

/// Site where the submit node and the workers share a regular filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalSite {
    attributes: Attributes,
}

impl LocalSite {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }
}

impl HostStrategy for LocalSite {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn ensure_output_directory(&self, path: &Path) -> Result<(), SiteError> {
        if path.is_dir() {
            debug!("Output directory {} already exists", path.display());

            return Ok(());
        }

        fs::create_dir_all(path).map_err(|source| SiteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Created output directory {}", path.display());

        Ok(())
    }

    fn enumerate_inputs(
        &self,
        input_dir: &Path,
        pattern: &GlobMatcher,
    ) -> Result<Vec<ItemDatum>, SiteError> {
        Ok(glob_inputs(input_dir, pattern)?
            .into_iter()
            .map(|path| ItemDatum::new(path.to_string_lossy().into_owned()))
            .collect())
    }

    fn output_transfer_command(
        &self,
        output_file: &str,
        destination: &Path,
    ) -> Result<String, SiteError> {
        Ok(format!(
            "rsync -avh {output_file} {}/{}",
            destination.to_string_lossy().trim_end_matches('/'),
            per_job_file_name(output_file)
        ))
    }

    fn site_attributes(&self, _input_dir: Option<&Path>) -> Result<Attributes, SiteError> {
        Ok(self.attributes.clone())
    }
}
