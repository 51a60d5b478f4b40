//! Group derivation and averaging benchmarks
//!
//! Every member derives and orders the group on its own at round start, so
//! this sits on the critical path of every round.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use swarm_sync_core::accumulator::Contribution;
use swarm_sync_core::aggregation::weighted_average;
use swarm_sync_core::group::Group;
use swarm_sync_core::identity::PeerId;

fn peers(n: usize) -> Vec<PeerId> {
    (0..n as u32)
        .map(|i| PeerId::from_public_key(&i.to_be_bytes()))
        .collect()
}

fn bench_group_derive(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_derive");
    for n in [4usize, 16, 64, 256] {
        let members = peers(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &members, |b, members| {
            b.iter(|| Group::derive(black_box(42), members.iter().copied()))
        });
    }
    group.finish();
}

fn bench_weighted_average(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_average");
    let dim = 4_096;
    for n in [2usize, 8, 32] {
        let contributions: Vec<Contribution> = peers(n)
            .into_iter()
            .enumerate()
            .map(|(i, contributor)| Contribution {
                contributor,
                gradients: vec![i as f32 * 0.01; dim],
                samples: 16 + i as u64,
            })
            .collect();
        group.throughput(Throughput::Elements((n * dim) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(n),
            &contributions,
            |b, contributions| b.iter(|| weighted_average(black_box(contributions))),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_group_derive, bench_weighted_average);
criterion_main!(benches);
