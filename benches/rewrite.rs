use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use meterlog::collection::{Identity, IdentitySet, StatsCollection};
use meterlog::history::Counters;
use meterlog::recorder::CombiningRewriter;
use meterlog::rotator::FileRotator;
use meterlog::snapshot::{SetKind, TAG_NONE};

fn pending_collection(uids: u32) -> StatsCollection {
    let mut ident = IdentitySet::new();
    ident.insert(Identity::new(1));

    let mut collection = StatsCollection::new(3_600_000);
    for uid in 0..uids {
        collection.record_data(
            &ident,
            uid,
            SetKind::Default,
            TAG_NONE,
            0,
            86_400_000,
            Counters {
                rx_bytes: 4096,
                rx_packets: 4,
                tx_bytes: 1024,
                tx_packets: 1,
                operations: 0,
            },
        );
    }
    collection
}

fn bench_rewrite_active(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite_active");
    for &uids in &[16u32, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(uids), &uids, |b, &uids| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let rotator = FileRotator::new(dir.path(), "stats", i64::MAX, i64::MAX)
                        .expect("rotator");
                    // seed the active file so the rewrite folds existing data
                    let mut seed = pending_collection(uids);
                    rotator
                        .rewrite_active(&mut CombiningRewriter::new(&mut seed), 0)
                        .expect("seed");
                    (dir, rotator, pending_collection(uids))
                },
                |(_dir, rotator, mut pending)| {
                    let mut rewriter = CombiningRewriter::new(&mut pending);
                    rotator
                        .rewrite_active(&mut rewriter, black_box(1000))
                        .expect("rewrite");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rewrite_active);
criterion_main!(benches);
