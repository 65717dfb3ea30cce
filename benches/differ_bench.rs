// benches/differ_bench.rs

//! Config differ and hash ring benchmarks.
//!
//! The differ runs on every watch tick and the ring on every dispatch, so
//! both sit on paths where a regression is felt immediately.

use citrine::config::{
    CacheType, ClusterConfig, HashDistribution, HashMethod, ListenProto, diff_cluster_configs,
};
use citrine::core::forwarder::HashRing;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

fn make_cluster(index: usize, server_count: usize) -> ClusterConfig {
    ClusterConfig {
        name: format!("cluster-{index}"),
        id: index,
        sn: index as u64,
        listen_proto: ListenProto::Tcp,
        listen_addr: format!("0.0.0.0:{}", 11211 + index),
        cache_type: CacheType::Memcache,
        hash_method: HashMethod::Fnv1a64,
        hash_distribution: HashDistribution::Ketama,
        hash_tag: String::new(),
        redis_auth: None,
        dial_timeout: Duration::from_secs(1),
        read_timeout: Duration::ZERO,
        write_timeout: Duration::ZERO,
        node_connections: 2,
        ping_fail_limit: 0,
        ping_auto_eject: false,
        close_when_change: false,
        servers: (0..server_count)
            .map(|i| format!("cache-{i}.internal:11211"))
            .collect(),
    }
}

fn bench_differ(c: &mut Criterion) {
    let old: Vec<ClusterConfig> = (0..64).map(|i| make_cluster(i, 16)).collect();

    // Identical sets: the common watch-tick case.
    let unchanged = old.clone();
    c.bench_function("diff_64_clusters_unchanged", |b| {
        b.iter(|| diff_cluster_configs(black_box(&unchanged), black_box(&old)))
    });

    // Half the clusters grew a backend.
    let mut half_changed = old.clone();
    for cluster in half_changed.iter_mut().step_by(2) {
        cluster.servers.push("cache-extra.internal:11211".into());
    }
    c.bench_function("diff_64_clusters_half_changed", |b| {
        b.iter(|| diff_cluster_configs(black_box(&half_changed), black_box(&old)))
    });
}

fn bench_ring(c: &mut Criterion) {
    let servers: Vec<String> = (0..32).map(|i| format!("cache-{i}.internal:11211")).collect();

    c.bench_function("ring_build_32_nodes", |b| {
        b.iter(|| {
            HashRing::build(
                black_box(&servers),
                HashMethod::Fnv1a64,
                HashDistribution::Ketama,
            )
        })
    });

    let ring = HashRing::build(&servers, HashMethod::Fnv1a64, HashDistribution::Ketama);
    let keys: Vec<String> = (0..1024).map(|i| format!("user:{i}:profile")).collect();
    c.bench_function("ring_dispatch_1k_keys", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(ring.node_for(ring.hash_key(key.as_bytes())));
            }
        })
    });
}

criterion_group!(benches, bench_differ, bench_ring);
criterion_main!(benches);
