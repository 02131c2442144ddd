use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::rc::Rc;

use meterlog::collection::{Identity, IdentitySet, StatsCollection, Template};
use meterlog::recorder::{RecorderConfig, SnapshotRecorder};
use meterlog::rotator::FileRotator;
use meterlog::snapshot::{Entry, IgnoringObserver, NonMonotonicObserver, SetKind, Snapshot, TAG_NONE};
use tempfile::tempdir;

fn iface_identities() -> HashMap<String, IdentitySet> {
    let mut map = HashMap::new();
    let mut set = IdentitySet::new();
    set.insert(Identity::new(1));
    map.insert("eth0".to_string(), set);
    map
}

fn snapshot_rx(elapsed_millis: i64, rx_bytes: i64) -> Snapshot {
    let mut snapshot = Snapshot::new(elapsed_millis);
    let mut entry = Entry::new("eth0", 10, SetKind::Default, TAG_NONE);
    entry.rx_bytes = rx_bytes;
    entry.rx_packets = rx_bytes / 100;
    snapshot.record(entry);
    snapshot
}

fn recorder(dir: &std::path::Path, threshold: i64) -> SnapshotRecorder {
    let rotator = FileRotator::new(dir, "stats", i64::MAX, i64::MAX).expect("rotator");
    SnapshotRecorder::new(
        rotator,
        Box::new(IgnoringObserver),
        RecorderConfig {
            cookie: "stats".to_string(),
            bucket_duration_millis: 1000,
            persist_threshold_bytes: threshold,
            only_tags: false,
        },
    )
}

fn disk_total(dir: &std::path::Path) -> i64 {
    let rotator = FileRotator::new(dir, "stats", i64::MAX, i64::MAX).expect("rotator");
    let mut collection = StatsCollection::new(1000);
    rotator
        .read_matching(&mut collection, i64::MIN, i64::MAX)
        .expect("read_matching");
    collection.total_bytes()
}

#[test]
fn bootstrap_snapshot_records_nothing() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), i64::MAX);

    recorder.record_snapshot(snapshot_rx(1000, 500), &iface_identities(), 1000);
    recorder.maybe_persist(1000);

    assert_eq!(recorder.pending_bytes(), 0);
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);

    recorder.record_snapshot(snapshot_rx(2000, 1500), &iface_identities(), 2000);
    assert_eq!(recorder.pending_bytes(), 1000);
}

#[test]
fn pending_crosses_threshold() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), 500);

    recorder.record_snapshot(snapshot_rx(0, 0), &iface_identities(), 0);

    recorder.record_snapshot(snapshot_rx(1000, 200), &iface_identities(), 1000);
    recorder.maybe_persist(1000);
    assert_eq!(recorder.pending_bytes(), 200);
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);

    recorder.record_snapshot(snapshot_rx(2000, 600), &iface_identities(), 2000);
    recorder.maybe_persist(2000);
    assert_eq!(recorder.pending_bytes(), 0);
    assert_eq!(disk_total(dir.path()), 600);

    recorder.record_snapshot(snapshot_rx(3000, 650), &iface_identities(), 3000);
    recorder.maybe_persist(3000);
    assert_eq!(recorder.pending_bytes(), 50);
    assert_eq!(disk_total(dir.path()), 600);
}

#[test]
fn persist_failure_retains_pending() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("stats");
    let mut recorder = recorder(&base, 500);

    recorder.record_snapshot(snapshot_rx(0, 0), &iface_identities(), 0);
    recorder.record_snapshot(snapshot_rx(1000, 600), &iface_identities(), 1000);

    // make the write fail by removing the directory out from under it
    fs::remove_dir_all(&base).expect("remove dir");
    recorder.maybe_persist(1000);
    assert_eq!(recorder.pending_bytes(), 600);

    // next attempt succeeds and drains pending
    fs::create_dir_all(&base).expect("recreate dir");
    recorder.force_persist(2000);
    assert_eq!(recorder.pending_bytes(), 0);
    assert_eq!(disk_total(&base), 600);
}

#[test]
fn force_persist_without_dirty_pending_is_noop() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), 500);

    recorder.force_persist(1000);
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
}

#[test]
fn tag_classes_partition_the_delta() {
    let dir = tempdir().expect("tempdir");

    let make = |prefix: &str, only_tags: bool| {
        let rotator =
            FileRotator::new(dir.path().join(prefix), prefix, i64::MAX, i64::MAX).expect("rotator");
        SnapshotRecorder::new(
            rotator,
            Box::new(IgnoringObserver),
            RecorderConfig {
                cookie: prefix.to_string(),
                bucket_duration_millis: 1000,
                persist_threshold_bytes: i64::MAX,
                only_tags,
            },
        )
    };
    let mut untagged = make("dev", false);
    let mut tagged = make("tag", true);

    let snapshot_at = |scale: i64| {
        let mut snapshot = Snapshot::new(scale * 1000);
        let mut plain = Entry::new("eth0", 10, SetKind::Default, TAG_NONE);
        plain.rx_bytes = 100 * scale;
        snapshot.record(plain);
        let mut with_tag = Entry::new("eth0", 10, SetKind::Default, 0x30);
        with_tag.tx_bytes = 7 * scale;
        snapshot.record(with_tag);
        snapshot
    };

    for recorder in [&mut untagged, &mut tagged] {
        recorder.record_snapshot(snapshot_at(1), &iface_identities(), 1000);
        recorder.record_snapshot(snapshot_at(2), &iface_identities(), 2000);
    }

    // union of the two recorders equals the full delta, intersection empty
    assert_eq!(untagged.pending_bytes(), 100);
    assert_eq!(tagged.pending_bytes(), 7);
}

#[test]
fn unknown_interfaces_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), i64::MAX);

    let mut first = Snapshot::new(1000);
    let mut entry = Entry::new("mystery0", 10, SetKind::Default, TAG_NONE);
    entry.rx_bytes = 100;
    first.record(entry);

    let mut second = Snapshot::new(2000);
    let mut entry = Entry::new("mystery0", 10, SetKind::Default, TAG_NONE);
    entry.rx_bytes = 900;
    second.record(entry);

    recorder.record_snapshot(first, &iface_identities(), 1000);
    recorder.record_snapshot(second, &iface_identities(), 2000);

    assert_eq!(recorder.pending_bytes(), 0);
}

#[test]
fn non_monotonic_counters_reach_observer() {
    struct SharedObserver(Rc<RefCell<Vec<String>>>);
    impl NonMonotonicObserver for SharedObserver {
        fn found_non_monotonic(&mut self, cookie: &str, entry: &Entry) {
            self.0.borrow_mut().push(format!("{cookie}:{}", entry.iface));
        }
    }

    let dir = tempdir().expect("tempdir");
    let reports = Rc::new(RefCell::new(Vec::new()));
    let rotator = FileRotator::new(dir.path(), "stats", i64::MAX, i64::MAX).expect("rotator");
    let mut recorder = SnapshotRecorder::new(
        rotator,
        Box::new(SharedObserver(Rc::clone(&reports))),
        RecorderConfig {
            cookie: "dev".to_string(),
            bucket_duration_millis: 1000,
            persist_threshold_bytes: i64::MAX,
            only_tags: false,
        },
    );

    recorder.record_snapshot(snapshot_rx(1000, 900), &iface_identities(), 1000);
    // counter resets backwards, e.g. the underlying device restarted
    recorder.record_snapshot(snapshot_rx(2000, 100), &iface_identities(), 2000);

    assert_eq!(*reports.borrow(), vec!["dev:eth0".to_string()]);
    // the delta is clamped, never negative
    assert_eq!(recorder.pending_bytes(), 0);
}

#[test]
fn since_boot_survives_persistence() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), 500);

    recorder.record_snapshot(snapshot_rx(0, 0), &iface_identities(), 0);
    recorder.record_snapshot(snapshot_rx(1000, 600), &iface_identities(), 1000);
    recorder.maybe_persist(1000);
    recorder.record_snapshot(snapshot_rx(2000, 650), &iface_identities(), 2000);

    assert_eq!(recorder.pending_bytes(), 50);
    assert_eq!(recorder.total_since_boot(&Template::any()).rx_bytes, 650);
}

#[test]
fn complete_cache_stays_live_while_held() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), 500);

    recorder.record_snapshot(snapshot_rx(0, 0), &iface_identities(), 0);
    recorder.record_snapshot(snapshot_rx(1000, 600), &iface_identities(), 1000);
    recorder.maybe_persist(1000);

    let complete = recorder.get_or_load_complete();
    assert_eq!(
        complete
            .borrow()
            .summarize(&Template::any(), i64::MIN, i64::MAX)
            .rx_bytes,
        600
    );

    // second call resolves the same cached instance
    let again = recorder.get_or_load_complete();
    assert!(Rc::ptr_eq(&complete, &again));

    // while a strong handle is held, new deltas keep it current
    recorder.record_snapshot(snapshot_rx(2000, 700), &iface_identities(), 2000);
    assert_eq!(
        complete
            .borrow()
            .summarize(&Template::any(), i64::MIN, i64::MAX)
            .rx_bytes,
        700
    );

    // dropping every strong handle forces a rebuild from disk + pending
    drop(again);
    drop(complete);
    let rebuilt = recorder.get_or_load_complete();
    assert_eq!(
        rebuilt
            .borrow()
            .summarize(&Template::any(), i64::MIN, i64::MAX)
            .rx_bytes,
        700
    );
}

#[test]
fn reset_clears_memory_but_not_disk() {
    let dir = tempdir().expect("tempdir");
    let mut recorder = recorder(dir.path(), 500);

    recorder.record_snapshot(snapshot_rx(0, 0), &iface_identities(), 0);
    recorder.record_snapshot(snapshot_rx(1000, 600), &iface_identities(), 1000);
    recorder.maybe_persist(1000);

    recorder.reset();
    assert_eq!(recorder.pending_bytes(), 0);
    assert_eq!(recorder.total_since_boot(&Template::any()).rx_bytes, 0);
    assert_eq!(disk_total(dir.path()), 600);

    // after reset the next snapshot is a fresh bootstrap
    recorder.record_snapshot(snapshot_rx(5000, 900), &iface_identities(), 5000);
    assert_eq!(recorder.pending_bytes(), 0);
}
