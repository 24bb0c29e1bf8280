use super::{per_job_file_name, HostStrategy, ItemDatum, SiteError};
use crate::{command, config::Attributes};
use globset::GlobMatcher;
use itertools::Itertools;
use std::{collections::BTreeMap, fmt::Debug, net::IpAddr, path::Path, time::Duration};
use tracing::{debug, info, warn};

/// Namespace and block placement queries against a Hadoop filesystem
pub trait HdfsClient: Debug {
    /// `mkdir -p`, existing directories are not an error
    fn mkdir(&self, path: &str) -> Result<(), SiteError>;

    /// all regular files below `dir`, recursively, as paths or `hdfs://` uris
    fn list_files(&self, dir: &str) -> Result<Vec<String>, SiteError>;

    /// datanodes holding the first block of `file`, as reported by the namenode
    fn block_hosts(&self, file: &str) -> Result<Vec<String>, SiteError>;

    /// datanode address (without port) -> hostname
    fn datanode_hostnames(&self) -> Result<BTreeMap<String, String>, SiteError>;

    /// hostname of a single address, for datanodes the report did not name
    fn reverse_lookup(&self, address: &str) -> Option<String>;
}

/// `hdfs` command line client
#[derive(Debug, Clone)]
pub struct HdfsCli {
    timeout: Duration,
}

impl HdfsCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl HdfsClient for HdfsCli {
    fn mkdir(&self, path: &str) -> Result<(), SiteError> {
        command::run("hdfs", ["dfs", "-mkdir", "-p", path], self.timeout)?;

        Ok(())
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>, SiteError> {
        let output = command::run("hdfs", ["dfs", "-ls", "-R", dir], self.timeout)?;

        Ok(output
            .stdout
            .lines()
            .filter_map(parse_ls_line)
            .filter(|(is_file, _)| *is_file)
            .map(|(_, path)| path)
            .collect_vec())
    }

    fn block_hosts(&self, file: &str) -> Result<Vec<String>, SiteError> {
        let output = command::run(
            "hdfs",
            ["fsck", file, "-files", "-blocks", "-locations"],
            self.timeout,
        )?;

        Ok(parse_first_block_hosts(&output.stdout))
    }

    fn datanode_hostnames(&self) -> Result<BTreeMap<String, String>, SiteError> {
        // the report needs superuser rights on some clusters
        match command::run("hdfs", ["dfsadmin", "-report"], self.timeout) {
            Ok(output) => Ok(parse_datanode_report(&output.stdout)),
            Err(error) => {
                warn!("Datanode report unavailable, resolving datanodes one by one: {error}");
                Ok(BTreeMap::new())
            }
        }
    }

    fn reverse_lookup(&self, address: &str) -> Option<String> {
        match command::run("getent", ["hosts", address], self.timeout) {
            Ok(output) => parse_getent_hosts(&output.stdout),
            Err(error) => {
                debug!("getent hosts {address}: {error}");
                None
            }
        }
    }
}

/// `-rw-r--r--   3 user group 1024 2021-10-01 12:00 /store/file.root` -> (true, path)
pub fn parse_ls_line(line: &str) -> Option<(bool, String)> {
    let mut rest = line.trim_start();
    let mut permissions = "";

    for index in 0..7 {
        let end = rest.find(char::is_whitespace)?;

        if index == 0 {
            permissions = &rest[..end];
        }
        rest = rest[end..].trim_start();
    }

    let path = rest.trim_end();
    if path.is_empty() {
        return None;
    }

    Some((permissions.starts_with('-'), path.to_owned()))
}

/// hosts of the first `DatanodeInfoWithStorage[host:port,...]` list in an fsck report
pub fn parse_first_block_hosts(report: &str) -> Vec<String> {
    const MARKER: &str = "DatanodeInfoWithStorage[";

    report
        .lines()
        .find(|line| line.contains(MARKER))
        .map(|line| {
            line.split(MARKER)
                .skip(1)
                .filter_map(|storage| storage.split([',', ']']).next())
                .map(|address| match address.rsplit_once(':') {
                    Some((host, _port)) => host,
                    None => address,
                })
                .filter(|host| !host.is_empty())
                .unique()
                .map(str::to_owned)
                .collect_vec()
        })
        .unwrap_or_default()
}

/// `Name: 10.0.0.11:9866 (kcms01.sscc.uos)` lines of a dfsadmin report, with the
/// `Hostname:` line of the same datanode used when the name has no hostname part
pub fn parse_datanode_report(report: &str) -> BTreeMap<String, String> {
    let mut hostnames = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in report.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("Name:") {
            let name = name.trim();
            let (address, hostname) = match name.split_once(' ') {
                Some((address, hostname)) => (
                    address,
                    hostname.trim().trim_start_matches('(').trim_end_matches(')'),
                ),
                None => (name, ""),
            };
            let address = address.rsplit_once(':').map_or(address, |(host, _port)| host);

            if hostname.is_empty() {
                current = Some(address.to_owned());
            } else {
                hostnames.insert(address.to_owned(), hostname.to_owned());
                current = None;
            }
        } else if let Some(hostname) = line.strip_prefix("Hostname:") {
            if let Some(address) = current.take() {
                hostnames.insert(address, hostname.trim().to_owned());
            }
        }
    }

    hostnames
}

/// `10.0.0.11       kcms01.sscc.uos kcms01` -> `kcms01.sscc.uos`
pub fn parse_getent_hosts(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
}

/// `hdfs://namenode:8020/store/file.root` -> `/store/file.root`
pub fn strip_authority(path: &str) -> &str {
    match path.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |index| &rest[index..]),
        None => path,
    }
}

/// Site storing data on a Hadoop filesystem, FUSE mounted at `fuse_root` on every node
///
/// Jobs reading from the mount are steered to the datanodes holding their input.
#[derive(Debug, Clone)]
pub struct HdfsSite<C: HdfsClient = HdfsCli> {
    fuse_root: String,
    free_nodes: Vec<String>,
    locality_weight: u32,
    attributes: Attributes,
    client: C,
}

impl<C: HdfsClient> HdfsSite<C> {
    pub fn new(
        fuse_root: String,
        free_nodes: Vec<String>,
        locality_weight: u32,
        attributes: Attributes,
        client: C,
    ) -> Self {
        Self {
            fuse_root: fuse_root.trim_end_matches('/').to_owned(),
            free_nodes,
            locality_weight,
            attributes,
            client,
        }
    }

    /// `path` lives below the FUSE mount of the distributed filesystem
    pub fn is_hadoop(&self, path: &Path) -> bool {
        self.hadoop_path(path).is_some()
    }

    fn hadoop_path(&self, path: &Path) -> Option<String> {
        let path = path.to_string_lossy();
        let rest = path.strip_prefix(self.fuse_root.as_str())?;

        if rest.is_empty() {
            Some("/".to_owned())
        } else if rest.starts_with('/') {
            Some(rest.to_owned())
        } else {
            None
        }
    }

    /// path inside the distributed filesystem for a path below the mount
    pub fn to_hdfs_path(&self, path: &Path, operation: &'static str) -> Result<String, SiteError> {
        self.hadoop_path(path)
            .ok_or_else(|| SiteError::unsupported(self.kind(), operation, path))
    }

    /// rank terms for one file: its datanodes first, weighted, then the free pool
    pub fn rank(&self, datanodes: &[String]) -> Vec<String> {
        datanodes
            .iter()
            .map(|node| format!("(machine==\"{node}\")*{}", self.locality_weight))
            .chain(
                self.free_nodes
                    .iter()
                    .map(|node| format!("(machine==\"{node}\")")),
            )
            .collect_vec()
    }

    // known hostnames are cached in `hostnames`, unresolved addresses are kept as they are
    fn hostname(&self, hostnames: &mut BTreeMap<String, String>, address: String) -> String {
        if let Some(hostname) = hostnames.get(&address) {
            return hostname.clone();
        }
        if address.parse::<IpAddr>().is_err() {
            return address;
        }

        match self.client.reverse_lookup(&address) {
            Some(hostname) => {
                hostnames.insert(address, hostname.clone());
                hostname
            }
            None => {
                warn!("Unable to resolve the hostname of datanode {address}, its rank term will not match");
                hostnames.insert(address.clone(), address.clone());
                address
            }
        }
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: HdfsClient> HostStrategy for HdfsSite<C> {
    fn kind(&self) -> &'static str {
        "hdfs"
    }

    fn ensure_output_directory(&self, path: &Path) -> Result<(), SiteError> {
        let hdfs_path = self.to_hdfs_path(path, "output directory creation")?;

        self.client.mkdir(&hdfs_path)?;
        info!("Ensured output directory {hdfs_path} on hdfs");

        Ok(())
    }

    fn enumerate_inputs(
        &self,
        input_dir: &Path,
        pattern: &GlobMatcher,
    ) -> Result<Vec<ItemDatum>, SiteError> {
        let hdfs_dir = self.to_hdfs_path(input_dir, "input enumeration")?;

        let files = self
            .client
            .list_files(&hdfs_dir)?
            .iter()
            .map(|file| strip_authority(file).to_owned())
            .filter(|file| {
                Path::new(file)
                    .file_name()
                    .map_or(false, |name| pattern.is_match(name))
            })
            .sorted()
            .dedup()
            .collect_vec();

        debug!("Found {} input files in {hdfs_dir}", files.len());
        if files.is_empty() {
            return Ok(Vec::new());
        }

        // fsck names datanodes by address, the scheduler matches on hostnames
        let mut hostnames = self.client.datanode_hostnames()?;
        let mut items = Vec::with_capacity(files.len());

        for file in files {
            let datanodes = self
                .client
                .block_hosts(&file)?
                .into_iter()
                .map(|address| self.hostname(&mut hostnames, address))
                .collect_vec();
            debug!(file = file.as_str(), datanodes = ?datanodes, "Located first block");

            items.push(ItemDatum {
                input_file: format!("{}{file}", self.fuse_root),
                rank: Some(self.rank(&datanodes)),
            });
        }

        Ok(items)
    }

    fn output_transfer_command(
        &self,
        output_file: &str,
        destination: &Path,
    ) -> Result<String, SiteError> {
        let hdfs_dir = self.to_hdfs_path(destination, "output transfer")?;

        Ok(format!(
            "hdfs dfs -put {output_file} {}/{}",
            hdfs_dir.trim_end_matches('/'),
            per_job_file_name(output_file)
        ))
    }

    fn site_attributes(&self, input_dir: Option<&Path>) -> Result<Attributes, SiteError> {
        let mut attributes = self.attributes.clone();

        if input_dir.map_or(false, |dir| self.is_hadoop(dir)) {
            attributes.insert("Rank".to_owned(), "$(rank)".to_owned());
        }

        Ok(attributes)
    }
}
