use super::{parse_cluster_id, render_items, render_submit_file, DryRun, SchedulerTransport, TransportError};
use crate::{
    builder::{AttrValue, Queue, Submission, SubmissionDescriptor},
    sites::ItemDatum,
};
use std::{collections::BTreeMap, path::Path};

fn descriptor(queue: Queue) -> SubmissionDescriptor {
    let mut attributes = BTreeMap::new();
    attributes.insert("universe".to_owned(), AttrValue::from("vanilla"));
    attributes.insert("request_memory".to_owned(), AttrValue::from("1GB"));
    attributes.insert(
        "transfer_input_files".to_owned(),
        AttrValue::List(vec!["a.py".to_owned(), "b.txt".to_owned()]),
    );
    attributes.insert("+JobType".to_owned(), AttrValue::from("MC"));
    attributes.insert("+SingularityImage".to_owned(), AttrValue::from("\"/cvmfs/image\""));

    SubmissionDescriptor { attributes, queue }
}

#[test]
pub fn count_queue_is_last_line() {
    let content = render_submit_file(&descriptor(Queue::Count(7)), None);
    let lines = content.lines().collect::<Vec<_>>();

    assert_eq!(lines.last(), Some(&"queue 7"));
    assert!(lines.contains(&"universe = vanilla"));
    assert!(lines.contains(&"transfer_input_files = a.py, b.txt"));
}

#[test]
pub fn custom_attributes_are_quoted_once() {
    let content = render_submit_file(&descriptor(Queue::Count(1)), None);

    assert!(content.contains("+JobType = \"MC\"\n"));
    assert!(content.contains("+SingularityImage = \"/cvmfs/image\"\n"));
    assert!(content.contains("request_memory = 1GB\n"));
}

#[test]
pub fn item_queue_reads_from_items_file() {
    let items = vec![ItemDatum::new("/data/a.root".to_owned()), ItemDatum::new("/data/b.root".to_owned())];
    let descriptor = descriptor(Queue::ItemData(items));

    let content = render_submit_file(&descriptor, Some(Path::new("/logs/items.txt")));
    assert!(content.ends_with("queue inputFile from /logs/items.txt\n"));

    assert_eq!(
        render_items(&descriptor).as_deref(),
        Some("/data/a.root\n/data/b.root\n")
    );
}

#[test]
pub fn ranked_items_carry_the_expression() {
    let items = vec![
        ItemDatum {
            input_file: "/hdfs/a.root".to_owned(),
            rank: Some(vec!["(machine==\"n1\")*3".to_owned(), "(machine==\"n2\")".to_owned()]),
        },
        ItemDatum::new("/hdfs/b.root".to_owned()),
    ];
    let descriptor = descriptor(Queue::ItemData(items));

    let content = render_submit_file(&descriptor, Some(Path::new("items.txt")));
    assert!(content.ends_with("queue inputFile,rank from items.txt\n"));

    assert_eq!(
        render_items(&descriptor).as_deref(),
        Some("/hdfs/a.root,(machine==\"n1\")*3 + (machine==\"n2\")\n/hdfs/b.root,0\n")
    );
}

#[test]
pub fn count_queue_has_no_items() {
    assert_eq!(render_items(&descriptor(Queue::Count(3))), None);
}

#[test]
pub fn cluster_id_from_terse_output() {
    assert_eq!(parse_cluster_id("123.0 - 123.9\n").ok(), Some(123));
    assert_eq!(parse_cluster_id("\n  42.0 - 42.0").ok(), Some(42));

    for output in ["", "Submitting job(s).", "abc.0 - abc.1"] {
        assert!(matches!(
            parse_cluster_id(output),
            Err(TransportError::UnexpectedOutput(_))
        ));
    }
}

#[test]
pub fn dry_run_submits_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let submission = Submission {
        wrapper_script: String::new(),
        descriptor: descriptor(Queue::Count(2)),
        launch_arguments: vec!["cfg.py".to_owned()],
        log_dir: tmp.path().to_path_buf(),
        executable: tmp.path().join("run.sh"),
        descriptor_path: tmp.path().join("submit.json"),
    };

    assert_eq!(DryRun.submit(&submission).unwrap(), None);
    assert!(!tmp.path().join("submit.sub").exists());
    assert!(!tmp.path().join("items.txt").exists());
}
