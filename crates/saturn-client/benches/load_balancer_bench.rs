// Criterion benchmarks for saturn-client load balancing
//
// Run benchmarks with:
//   cargo bench -p saturn-client
//
// For detailed output with plots:
//   cargo bench -p saturn-client -- --save-baseline main

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use saturn_client::{ChannelGroup, DirectoryGroupTable, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer};
use saturn_common::Address;

const DIR: &str = "bench-EchoService-1.0.0";

fn groups(count: u16, weighted: bool) -> Vec<Arc<ChannelGroup>> {
    (0..count)
        .map(|i| {
            let group = Arc::new(ChannelGroup::new(
                Address::new("127.0.0.1", 20000 + i),
                Duration::ZERO,
                Duration::from_secs(300),
            ));
            if weighted {
                group.put_weight(DIR, 10 + (i as u32 % 5) * 20);
            }
            group
        })
        .collect()
}

fn bench_round_robin(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_select");

    for count in [2u16, 10, 50].iter() {
        for weighted in [false, true] {
            let id = format!("{}_{}", count, if weighted { "weighted" } else { "equal" });
            group.bench_with_input(BenchmarkId::from_parameter(id), count, |b, &count| {
                let groups = groups(count, weighted);
                let lb = RoundRobinLoadBalancer::new();
                b.iter(|| lb.select(black_box(&groups), DIR));
            });
        }
    }

    group.finish();
}

fn bench_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_select");

    for count in [2u16, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let groups = groups(count, true);
            let lb = RandomLoadBalancer;
            b.iter(|| lb.select(black_box(&groups), DIR));
        });
    }

    group.finish();
}

fn bench_directory_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory_snapshot");

    group.bench_function("snapshot_20_groups", |b| {
        let table = DirectoryGroupTable::new();
        let list = table.find(DIR);
        for g in groups(20, false) {
            list.add_if_absent(g);
        }
        b.iter(|| black_box(list.snapshot()));
    });

    group.bench_function("add_remove", |b| {
        let table = DirectoryGroupTable::new();
        let list = table.find(DIR);
        for g in groups(20, false) {
            list.add_if_absent(g);
        }
        let extra = Arc::new(ChannelGroup::new(
            Address::new("127.0.0.1", 30000),
            Duration::ZERO,
            Duration::ZERO,
        ));
        b.iter(|| {
            list.add_if_absent(extra.clone());
            list.remove(extra.address());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_round_robin, bench_random, bench_directory_snapshot);
criterion_main!(benches);
