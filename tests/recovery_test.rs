//! Restart Recovery Tests
//!
//! Files left in the staging directory by a previous run (crash, or uploads
//! that gave up) are uploaded by the next start and then removed.

use bytes::Bytes;
use object_spool::spool::{
    Event, InMemoryObjectStore, OutputConfig, SimulatedClock, SimulatedObjectStore,
    SimulatedStoreConfig, SpoolOutput, UploadError, Uploader, UploaderConfig,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn record(kind: &str, line: &str) -> (Event, Bytes) {
    let fields = json!({ "type": kind, "message": line });
    let event = match fields {
        serde_json::Value::Object(map) => Event::new(map),
        _ => unreachable!(),
    };
    (event, Bytes::from(format!("{}\n", line)))
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        count_files(&path)
                    } else {
                        1
                    }
                })
                .sum()
        })
        .unwrap_or(0)
}

fn plant(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn test_leftover_files_uploaded_on_start() {
    let dir = tempfile::tempdir().unwrap();
    plant(dir.path(), "run-a/app/spool.a.part-0.data", b"one\ntwo\n");
    plant(dir.path(), "run-a/app/spool.a.part-1.data", b"three\n");
    plant(dir.path(), "run-b/web/nested/spool.b.part-0.data", b"four\n");
    plant(dir.path(), "run-b/web/spool.b.part-1.data", b"");

    let store = InMemoryObjectStore::new();
    let output = SpoolOutput::start_with(
        OutputConfig::test(dir.path().to_path_buf()),
        Arc::new(store.clone()),
        Arc::new(SimulatedClock::default()),
    )
    .unwrap();

    let stats = output.recovery_stats().unwrap();
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.bytes_queued, 19);
    assert_eq!(stats.deleted_empty, 1);
    output.stop();

    let objects = store.objects("spool");
    assert_eq!(objects.get("app/spool.a.part-0.data").unwrap().as_ref(), b"one\ntwo\n");
    assert_eq!(objects.get("app/spool.a.part-1.data").unwrap().as_ref(), b"three\n");
    assert_eq!(objects.get("web/nested/spool.b.part-0.data").unwrap().as_ref(), b"four\n");
    assert_eq!(objects.len(), 3);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_recovery_disabled_leaves_files() {
    let dir = tempfile::tempdir().unwrap();
    plant(dir.path(), "run-a/app/spool.a.part-0.data", b"kept\n");

    let store = InMemoryObjectStore::new();
    let config = OutputConfig {
        recover: false,
        ..OutputConfig::test(dir.path().to_path_buf())
    };
    let output =
        SpoolOutput::start_with(config, Arc::new(store.clone()), Arc::new(SimulatedClock::default()))
            .unwrap();
    assert!(output.recovery_stats().is_none());
    output.stop();

    assert!(store.is_empty());
    assert!(dir.path().join("run-a/app/spool.a.part-0.data").exists());
}

#[test]
fn test_top_level_files_are_not_touched() {
    let dir = tempfile::tempdir().unwrap();
    plant(dir.path(), "README", b"not ours\n");

    let store = InMemoryObjectStore::new();
    let output = SpoolOutput::start_with(
        OutputConfig::test(dir.path().to_path_buf()),
        Arc::new(store.clone()),
        Arc::new(SimulatedClock::default()),
    )
    .unwrap();
    assert_eq!(output.recovery_stats().unwrap().skipped, 1);
    output.stop();

    assert!(store.is_empty());
    assert!(dir.path().join("README").exists());
}

#[test]
fn test_given_up_uploads_recovered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryObjectStore::new();
    let faulty = Arc::new(SimulatedObjectStore::new(
        store.clone(),
        7,
        SimulatedStoreConfig::no_faults(),
    ));
    faulty.fail_next(1_000);

    let config = OutputConfig {
        max_upload_attempts: Some(2),
        retry_delay: Duration::from_millis(1),
        ..OutputConfig::test(dir.path().to_path_buf())
    };
    let output = SpoolOutput::start_with(config, faulty.clone(), Arc::new(SimulatedClock::default()))
        .unwrap();
    let batch: Vec<_> = (0..4).map(|i| record("app", &format!("line-{}", i))).collect();
    output.deliver(&batch).unwrap();
    output.stop();

    assert!(store.is_empty());
    assert_eq!(output.uploader_stats().gave_up, 1);
    assert_eq!(count_files(dir.path()), 1);
    drop(output);

    let restarted = SpoolOutput::start_with(
        OutputConfig::test(dir.path().to_path_buf()),
        Arc::new(store.clone()),
        Arc::new(SimulatedClock::default()),
    )
    .unwrap();
    assert_eq!(restarted.recovery_stats().unwrap().queued, 1);
    restarted.stop();

    let objects = store.objects("spool");
    assert_eq!(objects.len(), 1);
    let (key, data) = objects.iter().next().unwrap();
    assert!(key.starts_with("app/spool."));
    assert_eq!(data.as_ref(), b"line-0\nline-1\nline-2\nline-3\n");
    assert_eq!(count_files(dir.path()), 0);
}

#[test]
fn test_uploader_reports_give_up() {
    let dir = tempfile::tempdir().unwrap();
    plant(dir.path(), "run/app/spool.x.part-0.data", b"payload\n");
    let faulty = Arc::new(SimulatedObjectStore::new(
        InMemoryObjectStore::new(),
        1,
        SimulatedStoreConfig::no_faults(),
    ));
    faulty.fail_next(10);

    let uploader = Uploader::new(
        faulty,
        UploaderConfig {
            max_attempts: Some(3),
            retry_delay: Duration::from_millis(1),
            ..UploaderConfig::from_output(&OutputConfig::test(dir.path().to_path_buf()))
        },
    )
    .unwrap();
    let sealed = object_spool::spool::SealedFile::from_existing(
        &dir.path().join("run/app/spool.x.part-0.data"),
        dir.path(),
    )
    .unwrap();

    match uploader.upload(sealed, None) {
        Err(UploadError::GaveUp { key, attempts, .. }) => {
            assert_eq!(key, "app/spool.x.part-0.data");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
    assert!(dir.path().join("run/app/spool.x.part-0.data").exists());
    uploader.close();
}
