//! End-to-end recorder walkthrough.
//!
//! Feeds a few cumulative snapshots through a recorder, forces a persist,
//! and reads the complete history back from disk.

use std::collections::HashMap;

use meterlog::collection::{Identity, IdentitySet, Template};
use meterlog::recorder::{RecorderConfig, SnapshotRecorder};
use meterlog::rotator::FileRotator;
use meterlog::snapshot::{Entry, IgnoringObserver, SetKind, Snapshot, TAG_NONE};
use meterlog::Result;

fn main() -> Result<()> {
    env_logger::init();

    let dir = tempfile::tempdir().expect("tempdir");
    println!("=== meterlog demo (store under {}) ===\n", dir.path().display());

    let rotator = FileRotator::new(dir.path(), "dev", 3_600_000, 86_400_000)?;
    let mut recorder = SnapshotRecorder::new(
        rotator,
        Box::new(IgnoringObserver),
        RecorderConfig {
            cookie: "dev".to_string(),
            bucket_duration_millis: 600_000,
            persist_threshold_bytes: 64 * 1024,
            only_tags: false,
        },
    );

    let mut iface_identities = HashMap::new();
    let mut ident = IdentitySet::new();
    ident.insert(Identity::new(1));
    iface_identities.insert("eth0".to_string(), ident);

    // cumulative counters sampled once a minute
    for minute in 0..5i64 {
        let mut snapshot = Snapshot::new(minute * 60_000);
        let mut entry = Entry::new("eth0", 1000, SetKind::Default, TAG_NONE);
        entry.rx_bytes = minute * 50_000;
        entry.rx_packets = minute * 40;
        entry.tx_bytes = minute * 8_000;
        entry.tx_packets = minute * 10;
        snapshot.record(entry);

        let now = 1_700_000_000_000 + minute * 60_000;
        recorder.record_snapshot(snapshot, &iface_identities, now);
        recorder.maybe_persist(now);
        println!("minute {minute}: pending {} bytes", recorder.pending_bytes());
    }

    recorder.force_persist(1_700_000_300_000);
    println!("\nafter force_persist: pending {} bytes", recorder.pending_bytes());

    println!("\nfiles on disk:");
    for entry in std::fs::read_dir(dir.path())? {
        let entry = entry?;
        println!(
            "  {} ({} bytes)",
            entry.file_name().to_string_lossy(),
            entry.metadata()?.len()
        );
    }

    let complete = recorder.get_or_load_complete();
    let totals = complete
        .borrow()
        .summarize(&Template::any(), i64::MIN, i64::MAX);
    println!(
        "\ncomplete history: rx {} bytes / {} packets, tx {} bytes / {} packets",
        totals.rx_bytes, totals.rx_packets, totals.tx_bytes, totals.tx_packets
    );

    Ok(())
}
