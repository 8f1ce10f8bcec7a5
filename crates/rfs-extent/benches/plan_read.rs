//! Benchmark: read planning over fragmented extent maps.
//!
//! Measures `plan_read` on extent sets shaped like real recovery output:
//! a clean contiguous file, a heavily fragmented one, and one with
//! pathological overlap (every extent rewritten once).

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rfs_extent::plan_read;
use rfs_types::Extent;

const DEVICE_LEN: u64 = 1 << 30;
const FILE_SIZE: u64 = 1 << 24;

fn contiguous() -> Vec<Extent> {
    vec![Extent {
        logical: 0,
        length: FILE_SIZE,
        physical: 4096,
    }]
}

/// 4 KiB fragments, every other one missing (holes between).
fn fragmented() -> Vec<Extent> {
    (0..(FILE_SIZE / 8192))
        .map(|i| Extent {
            logical: i * 8192,
            length: 4096,
            physical: 1_000_000 + i * 4096,
        })
        .collect()
}

/// Every fragment indexed twice: base copy plus a later rewrite.
fn overlapping() -> Vec<Extent> {
    let mut extents = fragmented();
    let rewrites: Vec<Extent> = extents
        .iter()
        .map(|e| Extent {
            physical: e.physical + (1 << 28),
            ..*e
        })
        .collect();
    extents.extend(rewrites);
    extents
}

fn bench_plan_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_read");

    for (name, extents) in [
        ("contiguous", contiguous()),
        ("fragmented", fragmented()),
        ("overlapping", overlapping()),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(plan_read(
                    black_box(&extents),
                    FILE_SIZE,
                    black_box(1 << 20),
                    1 << 22,
                    DEVICE_LEN,
                ))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_plan_read);
criterion_main!(benches);
