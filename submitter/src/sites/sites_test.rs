use super::{
    glob_inputs,
    hdfs::{
        parse_datanode_report, parse_first_block_hosts, parse_getent_hosts, parse_ls_line,
        strip_authority, HdfsClient, HdfsSite,
    },
    local::LocalSite,
    per_job_file_name, replace_prefix,
    xrootd::{XrootdClient, XrootdSite},
    HostStrategy, ItemDatum, SiteError, SiteRegistry, Sites,
};
use crate::config::{Attributes, SubmitConfig};
use globset::{Glob, GlobMatcher};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};
use tempfile::TempDir;

const REDIRECTOR: &str = "root://cms-xrdr.private.lo:2094";

#[derive(Debug, Default)]
struct FakeXrootd {
    directories: RefCell<BTreeSet<String>>,
    calls: RefCell<usize>,
}

impl XrootdClient for FakeXrootd {
    fn mkdir_recursive(&self, path: &str) -> Result<(), SiteError> {
        *self.calls.borrow_mut() += 1;
        self.directories.borrow_mut().insert(path.to_owned());

        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeHdfs {
    files: Vec<String>,
    blocks: BTreeMap<String, Vec<String>>,
    // datanode report
    hostnames: BTreeMap<String, String>,
    // answers of the per-address lookup
    resolver: BTreeMap<String, String>,
    lookups: RefCell<Vec<String>>,
    directories: RefCell<BTreeSet<String>>,
}

impl HdfsClient for FakeHdfs {
    fn mkdir(&self, path: &str) -> Result<(), SiteError> {
        self.directories.borrow_mut().insert(path.to_owned());

        Ok(())
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>, SiteError> {
        Ok(self
            .files
            .iter()
            .filter(|file| strip_authority(file).starts_with(dir))
            .cloned()
            .collect())
    }

    fn block_hosts(&self, file: &str) -> Result<Vec<String>, SiteError> {
        Ok(self.blocks.get(file).cloned().unwrap_or_default())
    }

    fn datanode_hostnames(&self) -> Result<BTreeMap<String, String>, SiteError> {
        Ok(self.hostnames.clone())
    }

    fn reverse_lookup(&self, address: &str) -> Option<String> {
        self.lookups.borrow_mut().push(address.to_owned());
        self.resolver.get(address).cloned()
    }
}

fn root_files() -> GlobMatcher {
    Glob::new("*.root").unwrap().compile_matcher()
}

fn touch(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), b"").unwrap();
    }
}

fn xrootd_site(logical_prefix: String) -> XrootdSite<FakeXrootd> {
    let mut attributes = Attributes::new();
    attributes.insert("accounting_group".to_owned(), "group_cms".to_owned());

    XrootdSite::new(
        REDIRECTOR.to_owned(),
        logical_prefix,
        "/xrd/".to_owned(),
        attributes,
        FakeXrootd::default(),
    )
}

fn hdfs_site(client: FakeHdfs) -> HdfsSite<FakeHdfs> {
    HdfsSite::new(
        "/hdfs".to_owned(),
        vec!["kcms00.sscc.uos".to_owned(), "kcms09.sscc.uos".to_owned()],
        3,
        Attributes::new(),
        client,
    )
}

#[test]
pub fn resolve_builtin_sites() {
    let registry = SiteRegistry::new(&SubmitConfig::load(None).unwrap());

    for (host, kind) in [
        ("ui10.sdfarm.kr", "xrootd"),
        ("ui20.sdfarm.kr", "xrootd"),
        ("gate", "hdfs"),
        ("localhost", "local"),
    ] {
        let (_, site) = registry.resolve(host).unwrap();
        assert_eq!(site.kind(), kind, "{host}");
    }

    assert!(matches!(registry.resolve("gate").unwrap().1, Sites::Hdfs(_)));
}

#[test]
pub fn resolve_is_total_over_registered_hosts() {
    let registry = SiteRegistry::new(&SubmitConfig::load(None).unwrap());

    for host in registry.hosts() {
        assert!(registry.resolve(host).is_ok(), "{host}");
    }
}

#[test]
pub fn resolve_unknown_host_fails() {
    let registry = SiteRegistry::new(&SubmitConfig::load(None).unwrap());

    for host in ["lxplus.cern.ch", "ui10", "GATE", "gate.sscc.uos", ""] {
        assert!(matches!(
            registry.resolve(host),
            Err(SiteError::UnknownSite(unknown)) if unknown == host
        ));
    }
}

#[test]
pub fn per_job_names() {
    assert_eq!(per_job_file_name("out.root"), "out_$(ProcId).root");
    assert_eq!(per_job_file_name("hist.tar.gz"), "hist.tar_$(ProcId).gz");
    assert_eq!(per_job_file_name("output"), "output_$(ProcId)");
}

#[test]
pub fn prefix_replacement() {
    assert_eq!(
        replace_prefix(Path::new("/xrootd/store/user"), "/xrootd/", "/xrd/").as_deref(),
        Some("/xrd/store/user")
    );
    assert_eq!(
        replace_prefix(Path::new("/xrootd"), "/xrootd/", "/xrd/").as_deref(),
        Some("/xrd/")
    );
    assert_eq!(replace_prefix(Path::new("/xrootdx/a"), "/xrootd/", "/xrd/"), None);
    assert_eq!(replace_prefix(Path::new("/data/a"), "/xrootd/", "/xrd/"), None);
}

#[test]
pub fn local_output_directory_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let output = tmp.path().join("a").join("b");
    let site = LocalSite::default();

    site.ensure_output_directory(&output).unwrap();
    fs::write(output.join("kept.root"), b"data").unwrap();
    site.ensure_output_directory(&output).unwrap();

    assert!(output.is_dir());
    assert_eq!(fs::read(output.join("kept.root")).unwrap(), b"data");
    assert_eq!(fs::read_dir(&output).unwrap().count(), 1);
}

#[test]
pub fn local_inputs_match_pattern() {
    let tmp = TempDir::new().unwrap();
    touch(tmp.path(), &["c.root", "a.root", "b.root", "notes.txt", ".hidden.root"]);
    fs::create_dir(tmp.path().join("nested.root")).unwrap();
    touch(&tmp.path().join("nested.root"), &["deep.root"]);

    let items = LocalSite::default()
        .enumerate_inputs(tmp.path(), &root_files())
        .unwrap();
    let names = items
        .iter()
        .map(|item| {
            Path::new(&item.input_file)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect::<Vec<_>>();

    assert_eq!(names, [".hidden.root", "a.root", "b.root", "c.root"]);
    assert!(items.iter().all(|item| item.rank.is_none()));
}

#[test]
pub fn local_inputs_empty_directory() {
    let tmp = TempDir::new().unwrap();
    touch(tmp.path(), &["readme.md"]);

    assert!(LocalSite::default()
        .enumerate_inputs(tmp.path(), &root_files())
        .unwrap()
        .is_empty());
}

#[test]
pub fn missing_input_directory() {
    let tmp = TempDir::new().unwrap();

    assert!(matches!(
        glob_inputs(&tmp.path().join("missing"), &root_files()),
        Err(SiteError::InputDirectory(_))
    ));
}

#[test]
pub fn local_transfer_command() {
    let command = LocalSite::default()
        .output_transfer_command("out.root", Path::new("/data/results/"))
        .unwrap();

    assert_eq!(command, "rsync -avh out.root /data/results/out_$(ProcId).root");
}

#[test]
pub fn xrootd_output_directory_translation() {
    let site = xrootd_site("/xrootd/".to_owned());
    let output = Path::new("/xrootd/store/user/gem/run1");

    site.ensure_output_directory(output).unwrap();
    site.ensure_output_directory(output).unwrap();

    let directories = site.client().directories.borrow();
    assert_eq!(
        directories.iter().collect::<Vec<_>>(),
        ["/xrd/store/user/gem/run1"]
    );
    assert_eq!(*site.client().calls.borrow(), 2);
}

#[test]
pub fn xrootd_rejects_foreign_paths() {
    let site = xrootd_site("/xrootd/".to_owned());

    for result in [
        site.ensure_output_directory(Path::new("/home/user/out")),
        site.output_transfer_command("out.root", Path::new("/home/user/out"))
            .map(|_| ()),
        site.enumerate_inputs(Path::new("/data/in"), &root_files())
            .map(|_| ()),
    ] {
        assert!(matches!(
            result,
            Err(SiteError::SiteOperationUnsupported { site: "xrootd", .. })
        ));
    }
    assert!(site.client().directories.borrow().is_empty());
}

#[test]
pub fn xrootd_inputs_are_urls() {
    let tmp = TempDir::new().unwrap();
    touch(tmp.path(), &["run_1.root", "run_2.root", "run_3.root", "run.log"]);
    let site = xrootd_site(format!("{}/", tmp.path().display()));

    let items = site.enumerate_inputs(tmp.path(), &root_files()).unwrap();

    assert_eq!(
        items,
        ["run_1.root", "run_2.root", "run_3.root"]
            .iter()
            .map(|name| ItemDatum::new(format!("{REDIRECTOR}//xrd/{name}")))
            .collect::<Vec<_>>()
    );
}

#[test]
pub fn xrootd_transfer_and_attributes() {
    let site = xrootd_site("/xrootd/".to_owned());

    assert_eq!(
        site.output_transfer_command("out.root", Path::new("/xrootd/store/user/gem"))
            .unwrap(),
        "xrdcp -v out.root root://cms-xrdr.private.lo:2094//xrd/store/user/gem/out_$(ProcId).root"
    );
    assert_eq!(
        site.site_attributes(None).unwrap().get("accounting_group").map(String::as_str),
        Some("group_cms")
    );
}

#[test]
pub fn hdfs_output_directory() {
    let site = hdfs_site(FakeHdfs::default());

    site.ensure_output_directory(Path::new("/hdfs/store/user/gem")).unwrap();
    site.ensure_output_directory(Path::new("/hdfs/store/user/gem")).unwrap();

    assert_eq!(
        site.client().directories.borrow().iter().collect::<Vec<_>>(),
        ["/store/user/gem"]
    );
    assert!(matches!(
        site.ensure_output_directory(Path::new("/scratch/gem")),
        Err(SiteError::SiteOperationUnsupported { site: "hdfs", .. })
    ));
    assert!(matches!(
        site.ensure_output_directory(Path::new("/hdfsx/gem")),
        Err(SiteError::SiteOperationUnsupported { .. })
    ));
}

#[test]
pub fn hdfs_inputs_carry_locality_rank() {
    let mut blocks = BTreeMap::new();
    blocks.insert(
        "/store/in/a.root".to_owned(),
        vec!["kcms01.sscc.uos".to_owned(), "kcms02.sscc.uos".to_owned()],
    );
    blocks.insert("/store/in/b.root".to_owned(), vec!["kcms03.sscc.uos".to_owned()]);

    let site = hdfs_site(FakeHdfs {
        files: vec![
            "hdfs://namenode.sscc.uos:8020/store/in/b.root".to_owned(),
            "/store/in/a.root".to_owned(),
            "/store/in/job.log".to_owned(),
        ],
        blocks,
        ..FakeHdfs::default()
    });

    let items = site
        .enumerate_inputs(Path::new("/hdfs/store/in"), &root_files())
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].input_file, "/hdfs/store/in/a.root");
    assert_eq!(
        items[0].rank.as_deref().unwrap(),
        [
            "(machine==\"kcms01.sscc.uos\")*3",
            "(machine==\"kcms02.sscc.uos\")*3",
            "(machine==\"kcms00.sscc.uos\")",
            "(machine==\"kcms09.sscc.uos\")",
        ]
    );
    assert_eq!(items[1].input_file, "/hdfs/store/in/b.root");
    assert_eq!(
        items[1].rank_expression().unwrap(),
        "(machine==\"kcms03.sscc.uos\")*3 + (machine==\"kcms00.sscc.uos\") + (machine==\"kcms09.sscc.uos\")"
    );
}

#[test]
pub fn hdfs_non_hadoop_inputs_are_unsupported() {
    let site = hdfs_site(FakeHdfs::default());

    assert!(matches!(
        site.enumerate_inputs(Path::new("/data/in"), &root_files()),
        Err(SiteError::SiteOperationUnsupported {
            operation: "input enumeration",
            ..
        })
    ));
}

#[test]
pub fn hdfs_transfer_and_rank_attribute() {
    let site = hdfs_site(FakeHdfs::default());

    assert_eq!(
        site.output_transfer_command("out.root", Path::new("/hdfs/store/out"))
            .unwrap(),
        "hdfs dfs -put out.root /store/out/out_$(ProcId).root"
    );
    assert_eq!(
        site.site_attributes(Some(Path::new("/hdfs/store/in")))
            .unwrap()
            .get("Rank")
            .map(String::as_str),
        Some("$(rank)")
    );
    assert!(site.site_attributes(None).unwrap().get("Rank").is_none());
    assert!(site
        .site_attributes(Some(Path::new("/data/in")))
        .unwrap()
        .is_empty());
}

#[test]
pub fn ls_lines() {
    assert_eq!(
        parse_ls_line("-rw-r--r--   3 gem supergroup   1048576 2021-10-01 12:00 /store/in/a.root"),
        Some((true, "/store/in/a.root".to_owned()))
    );
    assert_eq!(
        parse_ls_line("drwxr-xr-x   - gem supergroup          0 2021-10-01 12:00 /store/in"),
        Some((false, "/store/in".to_owned()))
    );
    assert_eq!(parse_ls_line("Found 2 items"), None);
}

#[test]
pub fn fsck_first_block() {
    let report = "\
/store/in/a.root 268435456 bytes, replicated: replication=3, 2 block(s):  OK
0. BP-92959-10.0.0.1-1633:blk_1073741825_1001 len=134217728 Live_repl=3  [DatanodeInfoWithStorage[10.0.0.11:9866,DS-aaa,DISK], DatanodeInfoWithStorage[10.0.0.12:9866,DS-bbb,DISK]]
1. BP-92959-10.0.0.1-1633:blk_1073741826_1002 len=134217728 Live_repl=3  [DatanodeInfoWithStorage[10.0.0.13:9866,DS-ccc,DISK]]
";

    assert_eq!(parse_first_block_hosts(report), ["10.0.0.11", "10.0.0.12"]);
    assert!(parse_first_block_hosts("Status: HEALTHY").is_empty());
}

#[test]
pub fn uri_authority_is_stripped() {
    assert_eq!(strip_authority("hdfs://namenode:8020/store/a.root"), "/store/a.root");
    assert_eq!(strip_authority("/store/a.root"), "/store/a.root");
    assert_eq!(strip_authority("hdfs://namenode:8020"), "/");
}

#[test]
pub fn hdfs_rank_uses_datanode_hostnames() {
    let report = "\
/store/in/a.root 268435456 bytes, replicated: replication=3, 2 block(s):  OK
0. BP-92959-10.0.0.1-1633:blk_1073741825_1001 len=134217728 Live_repl=3  [DatanodeInfoWithStorage[10.0.0.11:9866,DS-aaa,DISK], DatanodeInfoWithStorage[10.0.0.12:9866,DS-bbb,DISK]]
";
    let mut blocks = BTreeMap::new();
    blocks.insert("/store/in/a.root".to_owned(), parse_first_block_hosts(report));
    blocks.insert("/store/in/b.root".to_owned(), vec!["10.0.0.11".to_owned(), "10.0.0.13".to_owned()]);

    let site = hdfs_site(FakeHdfs {
        files: vec!["/store/in/a.root".to_owned(), "/store/in/b.root".to_owned()],
        blocks,
        hostnames: parse_datanode_report(
            "Live datanodes (2):\n\nName: 10.0.0.11:9866 (kcms01.sscc.uos)\nHostname: kcms01.sscc.uos\n\nName: 10.0.0.12:9866 (kcms02.sscc.uos)\nHostname: kcms02.sscc.uos\n",
        ),
        resolver: BTreeMap::from([("10.0.0.13".to_owned(), "kcms03.sscc.uos".to_owned())]),
        ..FakeHdfs::default()
    });

    let items = site
        .enumerate_inputs(Path::new("/hdfs/store/in"), &root_files())
        .unwrap();

    assert_eq!(
        items[0].rank.as_deref().unwrap()[..2],
        [
            "(machine==\"kcms01.sscc.uos\")*3",
            "(machine==\"kcms02.sscc.uos\")*3",
        ]
    );
    assert_eq!(
        items[1].rank.as_deref().unwrap()[..2],
        [
            "(machine==\"kcms01.sscc.uos\")*3",
            "(machine==\"kcms03.sscc.uos\")*3",
        ]
    );
    for item in items.iter() {
        assert!(!item.rank_expression().unwrap().contains("10.0.0."));
    }

    // only the address missing from the report is looked up
    assert_eq!(site.client().lookups.borrow().as_slice(), ["10.0.0.13"]);
}

#[test]
pub fn hdfs_rank_keeps_hostnames_and_unresolved_addresses() {
    let mut blocks = BTreeMap::new();
    blocks.insert(
        "/store/in/a.root".to_owned(),
        vec!["kcms05.sscc.uos".to_owned(), "10.0.0.99".to_owned()],
    );
    blocks.insert("/store/in/b.root".to_owned(), vec!["10.0.0.99".to_owned()]);

    let site = hdfs_site(FakeHdfs {
        files: vec!["/store/in/a.root".to_owned(), "/store/in/b.root".to_owned()],
        blocks,
        ..FakeHdfs::default()
    });

    let items = site
        .enumerate_inputs(Path::new("/hdfs/store/in"), &root_files())
        .unwrap();

    assert_eq!(
        items[0].rank.as_deref().unwrap()[..2],
        ["(machine==\"kcms05.sscc.uos\")*3", "(machine==\"10.0.0.99\")*3"]
    );
    // failed lookups are not repeated
    assert_eq!(site.client().lookups.borrow().as_slice(), ["10.0.0.99"]);
}

#[test]
pub fn datanode_report_lines() {
    let report = "\
Configured Capacity: 1000 (1 KB)
-------------------------------------------------
Live datanodes (3):

Name: 10.0.0.11:9866 (kcms01.sscc.uos)
Hostname: kcms01.sscc.uos
Decommission Status : Normal

Name: 10.0.0.12:9866
Hostname: kcms02.sscc.uos

Name: 10.0.0.13:9866 (kcms03.sscc.uos)
";
    let hostnames = parse_datanode_report(report);

    assert_eq!(hostnames.len(), 3);
    assert_eq!(hostnames["10.0.0.11"], "kcms01.sscc.uos");
    assert_eq!(hostnames["10.0.0.12"], "kcms02.sscc.uos");
    assert_eq!(hostnames["10.0.0.13"], "kcms03.sscc.uos");
    assert!(parse_datanode_report("Status: HEALTHY").is_empty());
}

#[test]
pub fn getent_hosts_output() {
    assert_eq!(
        parse_getent_hosts("10.0.0.11       kcms01.sscc.uos kcms01\n").as_deref(),
        Some("kcms01.sscc.uos")
    );
    assert_eq!(parse_getent_hosts(""), None);
}
