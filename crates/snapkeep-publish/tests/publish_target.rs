// crates/snapkeep-publish/tests/publish_target.rs
// ============================================================================
// Module: Publish Target Tests
// Description: Backup lifecycle across noop, archive, local, and remote targets.
// Purpose: Validate startup restore, backups, and the periodic timer.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::ManualClock;
use snapkeep_core::MemoryEventSink;
use snapkeep_core::RetryPolicy;
use snapkeep_core::StopSignal;
use snapkeep_core::SystemClock;
use snapkeep_publish::ArchiveReceipt;
use snapkeep_publish::ArchiveTarget;
use snapkeep_publish::BackupJob;
use snapkeep_publish::DownloadOutcome;
use snapkeep_publish::InMemoryObjectStore;
use snapkeep_publish::LocalPublisher;
use snapkeep_publish::PeriodicBackup;
use snapkeep_publish::PublishReport;
use snapkeep_publish::PublishTarget;
use snapkeep_publish::RemotePublisher;
use snapkeep_store_sqlite::EventRow;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::SnapshotConfig;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_store_sqlite::StoreConfig;
use snapkeep_store_sqlite::inspect_copy;
use snapkeep_store_sqlite::insert_event;
use tempfile::TempDir;
use time::macros::datetime;

fn seeded_store(dir: &Path, rows: u64) -> PrimaryStore {
    let store = PrimaryStore::open(StoreConfig::new(dir.join("live.sqlite"))).unwrap();
    let connection = store.connection().unwrap();
    for seq in 1 ..= rows {
        insert_event(
            &connection,
            &EventRow {
                writer_id: 1,
                seq,
                payload: "payload",
                created_at: "2026-03-04T05:06:07Z",
            },
        )
        .unwrap();
    }
    drop(connection);
    store
}

fn engine() -> SnapshotEngine {
    SnapshotEngine::new(SnapshotConfig::default(), &EventLog::noop())
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "condition not reached in {deadline:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn noop_backup_takes_and_keeps_nothing() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 5);
    let staging = temp.path().join("staging");
    let target = PublishTarget::Noop;

    let report = target.backup(&engine(), store.path(), &staging, &Deadline::none()).unwrap();

    assert_eq!(report.snapshot, None);
    assert_eq!(report.publish, PublishReport::Noop);
    assert!(!staging.exists());
    assert_eq!(target.on_startup(store.path()).unwrap(), None);
    assert_eq!(target.published_copy(store.path(), &staging).unwrap(), store.path());
}

#[test]
fn archive_backup_writes_timestamped_snapshot() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 5);
    let clock = Arc::new(ManualClock::new(datetime!(2026-03-04 05:06:07 UTC)));
    let backups = temp.path().join("backups");
    let target = PublishTarget::Archive(ArchiveTarget::new(&backups, 3, clock, &EventLog::noop()).unwrap());

    let first = target.backup(&engine(), store.path(), &temp.path().join("staging"), &Deadline::none()).unwrap();
    let second = target.backup(&engine(), store.path(), &temp.path().join("staging"), &Deadline::none()).unwrap();

    let plain = backups.join("app-snapshot-20260304-050607.sqlite");
    let suffixed = backups.join("app-snapshot-20260304-050607-1.sqlite");
    assert_eq!(
        first.publish,
        PublishReport::Archive(ArchiveReceipt {
            path: plain.clone(),
            pruned: 0,
        })
    );
    assert!(matches!(second.publish, PublishReport::Archive(ref receipt) if receipt.path == suffixed));
    assert_eq!(inspect_copy(&plain).unwrap().rows, 5);
    assert_eq!(inspect_copy(&suffixed).unwrap().rows, 5);
    assert_eq!(target.published_copy(&plain, &backups).unwrap(), suffixed);
}

#[test]
fn archive_retention_bounds_repeated_backups() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 2);
    let clock = Arc::new(ManualClock::new(datetime!(2026-03-04 05:06:07 UTC)));
    let backups = temp.path().join("backups");
    fs::create_dir_all(&backups).unwrap();
    fs::write(backups.join("notes.txt"), b"kept").unwrap();
    let job = BackupJob {
        target: PublishTarget::Archive(ArchiveTarget::new(&backups, 4, clock.clone(), &EventLog::noop()).unwrap()),
        engine: engine(),
        source: store.path().to_path_buf(),
        staging_dir: temp.path().join("staging"),
        timeout: Duration::from_secs(10),
        log: EventLog::noop(),
    };

    let mut last = None;
    for run in 0 .. 20 {
        if run % 3 == 0 {
            clock.advance(Duration::from_secs(1));
        }
        let report = job.run_once(&StopSignal::new()).unwrap();
        assert!(matches!(report.publish, PublishReport::Archive(_)));
        last = Some(report);
        assert!(fs::read_dir(&backups).unwrap().count() <= 5);
    }

    let mut names: Vec<String> =
        fs::read_dir(&backups).unwrap().map(|entry| entry.unwrap().file_name().into_string().unwrap()).collect();
    names.sort();
    assert_eq!(names.len(), 5);
    assert!(names.contains(&"notes.txt".to_string()));
    let PublishReport::Archive(receipt) = last.unwrap().publish else {
        panic!("expected archive receipt");
    };
    assert!(receipt.path.is_file());
    assert_eq!(receipt.pruned, 1);
}

#[test]
fn archive_requires_positive_retention() {
    let temp = TempDir::new().unwrap();
    assert!(ArchiveTarget::new(temp.path(), 0, Arc::new(SystemClock), &EventLog::noop()).is_err());
}

#[test]
fn local_backup_installs_at_destination_and_clears_staging() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 9);
    let dest = temp.path().join("published").join("app.sqlite");
    let staging = temp.path().join("staging");
    let target = PublishTarget::Local(LocalPublisher::new(&dest, &EventLog::noop()));

    let report = target.on_shutdown(&engine(), store.path(), &staging, &Deadline::none()).unwrap();

    assert!(matches!(report.publish, PublishReport::Local(ref receipt) if receipt.path == dest));
    assert_eq!(inspect_copy(&dest).unwrap().rows, 9);
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    assert_eq!(target.published_copy(&staging.join("ignored"), &staging).unwrap(), dest);
}

#[test]
fn remote_target_restores_what_it_published() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 4);
    let objects = Arc::new(InMemoryObjectStore::new());
    let publisher = RemotePublisher::new(
        objects.clone(),
        "app.sqlite",
        Arc::new(SystemClock),
        &EventLog::noop(),
        RetryPolicy::default(),
    )
    .unwrap();
    let target = PublishTarget::Remote(publisher);
    let staging = temp.path().join("staging");

    let report = target.backup(&engine(), store.path(), &staging, &Deadline::none()).unwrap();
    assert!(matches!(report.publish, PublishReport::Remote(_)));

    let copy = target.published_copy(&staging.join("unused"), &staging).unwrap();
    assert_eq!(inspect_copy(&copy).unwrap().rows, 4);

    let restored = temp.path().join("fresh-node").join("app.sqlite");
    let outcome = target.on_startup(&restored).unwrap();
    assert!(matches!(outcome, Some(DownloadOutcome::Downloaded { .. })));
    assert_eq!(inspect_copy(&restored).unwrap().rows, 4);
}

#[test]
fn periodic_backup_runs_until_stopped() {
    let temp = TempDir::new().unwrap();
    let store = seeded_store(temp.path(), 3);
    let sink = Arc::new(MemoryEventSink::new());
    let log = EventLog::new(sink.clone(), Arc::new(SystemClock));
    let dest = temp.path().join("app.sqlite");
    let job = BackupJob {
        target: PublishTarget::Local(LocalPublisher::new(&dest, &log)),
        engine: engine(),
        source: store.path().to_path_buf(),
        staging_dir: temp.path().join("staging"),
        timeout: Duration::from_secs(10),
        log,
    };

    let timer = PeriodicBackup::start(job, Duration::from_millis(20)).unwrap();
    wait_for(Duration::from_secs(10), || sink.count("periodic_backup") >= 2);
    let runs = timer.stop();

    assert!(runs >= 2);
    assert_eq!(inspect_copy(&dest).unwrap().rows, 3);
}

#[test]
fn periodic_backup_survives_failures() {
    let temp = TempDir::new().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let log = EventLog::new(sink.clone(), Arc::new(SystemClock));
    let job = BackupJob {
        target: PublishTarget::Local(LocalPublisher::new(temp.path().join("app.sqlite"), &log)),
        engine: engine(),
        source: temp.path().join("missing.sqlite"),
        staging_dir: temp.path().join("staging"),
        timeout: Duration::from_secs(1),
        log,
    };

    let timer = PeriodicBackup::start(job, Duration::from_millis(10)).unwrap();
    wait_for(Duration::from_secs(10), || sink.count("periodic_backup_failed") >= 3);
    drop(timer);

    assert_eq!(sink.count("periodic_backup"), 0);
}

#[test]
fn zero_interval_is_rejected() {
    let temp = TempDir::new().unwrap();
    let job = BackupJob {
        target: PublishTarget::Noop,
        engine: engine(),
        source: temp.path().join("live.sqlite"),
        staging_dir: temp.path().to_path_buf(),
        timeout: Duration::from_secs(1),
        log: EventLog::noop(),
    };
    assert!(PeriodicBackup::start(job, Duration::ZERO).is_err());
}
