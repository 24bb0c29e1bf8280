use super::{glob_inputs, per_job_file_name, replace_prefix, HostStrategy, ItemDatum, SiteError};
use crate::{command, config::Attributes};
use globset::GlobMatcher;
use std::{fmt::Debug, path::Path, time::Duration};
use tracing::info;

/// Directory operations of an xrootd server
pub trait XrootdClient: Debug {
    /// `mkdir -p` on the server, existing directories are not an error
    fn mkdir_recursive(&self, path: &str) -> Result<(), SiteError>;
}

/// `xrdfs` command line client
#[derive(Debug, Clone)]
pub struct Xrdfs {
    redirector: String,
    timeout: Duration,
}

impl Xrdfs {
    pub fn new(redirector: String, timeout: Duration) -> Self {
        Self {
            redirector,
            timeout,
        }
    }
}

impl XrootdClient for Xrdfs {
    fn mkdir_recursive(&self, path: &str) -> Result<(), SiteError> {
        command::run(
            "xrdfs",
            [self.redirector.as_str(), "mkdir", "-p", path],
            self.timeout,
        )?;

        Ok(())
    }
}

/// Site whose storage is an xrootd object store, FUSE mounted on the submit node
///
/// A logical path like `/xrootd/store/user/run` is addressed as
/// `<redirector>//xrd/store/user/run` by jobs and as `/xrd/store/user/run` by the server.
#[derive(Debug, Clone)]
pub struct XrootdSite<C: XrootdClient = Xrdfs> {
    redirector: String,
    logical_prefix: String,
    store_prefix: String,
    attributes: Attributes,
    client: C,
}

impl<C: XrootdClient> XrootdSite<C> {
    pub fn new(
        redirector: String,
        logical_prefix: String,
        store_prefix: String,
        attributes: Attributes,
        client: C,
    ) -> Self {
        Self {
            redirector: redirector.trim_end_matches('/').to_owned(),
            logical_prefix,
            store_prefix,
            attributes,
            client,
        }
    }

    /// path as seen by the xrootd server
    pub fn to_store_path(&self, path: &Path, operation: &'static str) -> Result<String, SiteError> {
        replace_prefix(path, &self.logical_prefix, &self.store_prefix)
            .ok_or_else(|| SiteError::unsupported(self.kind(), operation, path))
    }

    /// url a job uses to read or write `path`
    pub fn to_url(&self, path: &Path, operation: &'static str) -> Result<String, SiteError> {
        Ok(format!(
            "{}/{}",
            self.redirector,
            self.to_store_path(path, operation)?
        ))
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: XrootdClient> HostStrategy for XrootdSite<C> {
    fn kind(&self) -> &'static str {
        "xrootd"
    }

    fn ensure_output_directory(&self, path: &Path) -> Result<(), SiteError> {
        let store_path = self.to_store_path(path, "output directory creation")?;

        self.client.mkdir_recursive(&store_path)?;
        info!("Ensured output directory {store_path} on {}", self.redirector);

        Ok(())
    }

    fn enumerate_inputs(
        &self,
        input_dir: &Path,
        pattern: &GlobMatcher,
    ) -> Result<Vec<ItemDatum>, SiteError> {
        // fail on foreign paths before touching the filesystem
        self.to_store_path(input_dir, "input enumeration")?;

        glob_inputs(input_dir, pattern)?
            .iter()
            .map(|path| self.to_url(path, "input enumeration").map(ItemDatum::new))
            .collect()
    }

    fn output_transfer_command(
        &self,
        output_file: &str,
        destination: &Path,
    ) -> Result<String, SiteError> {
        let url = self.to_url(destination, "output transfer")?;

        Ok(format!(
            "xrdcp -v {output_file} {}/{}",
            url.trim_end_matches('/'),
            per_job_file_name(output_file)
        ))
    }

    fn site_attributes(&self, _input_dir: Option<&Path>) -> Result<Attributes, SiteError> {
        Ok(self.attributes.clone())
    }
}
