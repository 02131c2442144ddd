use std::collections::HashMap;
use std::fs;

use meterlog::collection::{Identity, IdentitySet, StatsCollection, Template};
use meterlog::history::Counters;
use meterlog::recorder::{RecorderConfig, RemoveUidRewriter, SnapshotRecorder};
use meterlog::rotator::{FileRotator, Rewriter, StreamReader};
use meterlog::snapshot::{Entry, IgnoringObserver, SetKind, TAG_NONE};
use tempfile::tempdir;

fn ident(kind: u32) -> IdentitySet {
    let mut set = IdentitySet::new();
    set.insert(Identity::new(kind));
    set
}

fn rx(rx_bytes: i64) -> Counters {
    Counters {
        rx_bytes,
        ..Counters::default()
    }
}

/// Serialized collection covering `[start, end)` with the given per-uid
/// counters.
fn collection_bytes(start_millis: i64, end_millis: i64, uids: &[(u32, i64)]) -> Vec<u8> {
    let mut collection = StatsCollection::new(100);
    for &(uid, rx_bytes) in uids {
        collection.record_data(
            &ident(1),
            uid,
            SetKind::Default,
            TAG_NONE,
            start_millis,
            end_millis,
            rx(rx_bytes),
        );
    }
    let mut buf = Vec::new();
    collection.write(&mut buf).expect("write collection");
    buf
}

fn read_file_totals(path: &std::path::Path, template: &Template) -> i64 {
    let mut collection = StatsCollection::new(100);
    let mut src = fs::File::open(path).expect("open");
    StatsCollection::read(&mut collection, &mut src).expect("read collection");
    collection.summarize(template, i64::MIN, i64::MAX).rx_bytes
}

#[test]
fn remove_uid_rewrites_only_dirty_files() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("stats.0-100"),
        collection_bytes(0, 100, &[(10, 500), (20, 300)]),
    )
    .expect("seed");
    fs::write(
        dir.path().join("stats.100-200"),
        collection_bytes(100, 200, &[(10, 50), (20, 70)]),
    )
    .expect("seed");
    // third file never contained uid 10
    fs::write(
        dir.path().join("stats.200-300"),
        collection_bytes(200, 300, &[(20, 90)]),
    )
    .expect("seed");

    let rotator = FileRotator::new(dir.path(), "stats", i64::MAX, i64::MAX).expect("rotator");
    let mut recorder = SnapshotRecorder::new(
        rotator,
        Box::new(IgnoringObserver),
        RecorderConfig {
            cookie: "stats".to_string(),
            bucket_duration_millis: 100,
            persist_threshold_bytes: i64::MAX,
            only_tags: false,
        },
    );

    recorder.remove_uid(10);

    for name in ["stats.0-100", "stats.100-200", "stats.200-300"] {
        let path = dir.path().join(name);
        assert_eq!(
            read_file_totals(&path, &Template::for_uid(10)),
            0,
            "uid 10 still present in {name}"
        );
    }
    assert_eq!(
        read_file_totals(&dir.path().join("stats.0-100"), &Template::for_uid(20)),
        300
    );
    assert_eq!(
        read_file_totals(&dir.path().join("stats.100-200"), &Template::for_uid(20)),
        70
    );
    assert_eq!(
        read_file_totals(&dir.path().join("stats.200-300"), &Template::for_uid(20)),
        90
    );
}

#[test]
fn rewriter_gate_reflects_removal() {
    let dirty_bytes = collection_bytes(0, 100, &[(10, 500), (20, 300)]);
    let clean_bytes = collection_bytes(0, 100, &[(20, 300)]);

    let mut rewriter = RemoveUidRewriter::new(100, 10);

    rewriter.reset();
    rewriter
        .read(&mut dirty_bytes.as_slice())
        .expect("read dirty");
    assert!(rewriter.should_write());

    rewriter.reset();
    rewriter
        .read(&mut clean_bytes.as_slice())
        .expect("read clean");
    assert!(!rewriter.should_write());
}

#[test]
fn remove_uid_strips_snapshot_baseline() {
    let dir = tempdir().expect("tempdir");
    let rotator = FileRotator::new(dir.path(), "stats", i64::MAX, i64::MAX).expect("rotator");
    let mut recorder = SnapshotRecorder::new(
        rotator,
        Box::new(IgnoringObserver),
        RecorderConfig {
            cookie: "stats".to_string(),
            bucket_duration_millis: 100,
            persist_threshold_bytes: i64::MAX,
            only_tags: false,
        },
    );

    let mut iface_identities = HashMap::new();
    iface_identities.insert("eth0".to_string(), ident(1));

    let snapshot = |elapsed: i64, rx_bytes: i64| {
        let mut snapshot = meterlog::snapshot::Snapshot::new(elapsed);
        let mut entry = Entry::new("eth0", 10, SetKind::Default, TAG_NONE);
        entry.rx_bytes = rx_bytes;
        snapshot.record(entry);
        snapshot
    };

    recorder.record_snapshot(snapshot(1000, 500), &iface_identities, 1000);
    recorder.remove_uid(10);

    // the baseline is gone, so the full cumulative value counts as delta
    recorder.record_snapshot(snapshot(2000, 800), &iface_identities, 2000);
    assert_eq!(recorder.pending_bytes(), 800);
}
