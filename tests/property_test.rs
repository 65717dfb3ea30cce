// tests/property_test.rs

//! Property-based tests for Citrine.
//!
//! These verify invariants of the pure pieces (the config differ and the hash
//! ring) that must hold regardless of input values.

use citrine::config::{
    CacheType, ClusterConfig, HashDistribution, HashMethod, ListenProto, diff_cluster_configs,
};
use citrine::core::forwarder::{HashRing, extract_hash_tag};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

fn make_cluster(name: &str, servers: Vec<String>, close_when_change: bool) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        id: 0,
        sn: 0,
        listen_proto: ListenProto::Tcp,
        listen_addr: format!("{name}.sock"),
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
        close_when_change,
        servers,
    }
}

fn arb_servers() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(1024u16..1040, 1..4).prop_map(|ports| {
        ports
            .into_iter()
            .map(|port| format!("cache:{port}"))
            .collect()
    })
}

type ClusterSeed = BTreeMap<String, (Vec<String>, bool)>;

fn arb_cluster_set() -> impl Strategy<Value = ClusterSeed> {
    prop::collection::btree_map("[a-f]{1,3}", (arb_servers(), any::<bool>()), 0..8)
}

fn to_configs(seed: &ClusterSeed) -> Vec<ClusterConfig> {
    seed.iter()
        .map(|(name, (servers, close))| make_cluster(name, servers.clone(), *close))
        .collect()
}

fn sorted_names(configs: &[ClusterConfig]) -> Vec<String> {
    let mut names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
    names.sort_unstable();
    names
}

proptest! {
    #[test]
    fn diff_is_deterministic_and_order_insensitive(
        old_seed in arb_cluster_set(),
        new_seed in arb_cluster_set(),
    ) {
        let old = to_configs(&old_seed);
        let new = to_configs(&new_seed);

        let (changed_a, added_a) = diff_cluster_configs(&new, &old);
        let (changed_b, added_b) = diff_cluster_configs(&new, &old);
        prop_assert_eq!(sorted_names(&changed_a), sorted_names(&changed_b));
        prop_assert_eq!(sorted_names(&added_a), sorted_names(&added_b));

        // Any permutation of either input classifies identically.
        let mut old_reversed = old.clone();
        old_reversed.reverse();
        let mut new_reversed = new.clone();
        new_reversed.reverse();
        let (changed_c, added_c) = diff_cluster_configs(&new_reversed, &old_reversed);
        prop_assert_eq!(sorted_names(&changed_a), sorted_names(&changed_c));
        prop_assert_eq!(sorted_names(&added_a), sorted_names(&added_c));
    }

    #[test]
    fn diff_classifies_against_the_old_set(
        old_seed in arb_cluster_set(),
        new_seed in arb_cluster_set(),
    ) {
        let mut old = to_configs(&old_seed);
        for (id, config) in old.iter_mut().enumerate() {
            config.id = id;
        }
        let new = to_configs(&new_seed);

        let (changed, added) = diff_cluster_configs(&new, &old);

        for entry in &added {
            prop_assert!(!old.iter().any(|o| o.name == entry.name));
        }
        for entry in &changed {
            let previous = old.iter().find(|o| o.name == entry.name);
            prop_assert!(previous.is_some());
            // A changed entry inherits the id of the cluster it replaces.
            prop_assert_eq!(entry.id, previous.unwrap().id);
        }
        // Nothing is both changed and added.
        for entry in &changed {
            prop_assert!(!added.iter().any(|a| a.name == entry.name));
        }
    }

    #[test]
    fn diff_of_identical_sets_is_empty(seed in arb_cluster_set()) {
        let configs = to_configs(&seed);
        let (changed, added) = diff_cluster_configs(&configs, &configs);
        prop_assert!(changed.is_empty());
        prop_assert!(added.is_empty());
    }
}

fn arb_hash_method() -> impl Strategy<Value = HashMethod> {
    prop_oneof![
        Just(HashMethod::Fnv1a64),
        Just(HashMethod::Crc16),
        Just(HashMethod::Murmur3),
    ]
}

fn arb_distribution() -> impl Strategy<Value = HashDistribution> {
    prop_oneof![Just(HashDistribution::Ketama), Just(HashDistribution::Modula)]
}

proptest! {
    #[test]
    fn ring_dispatch_stays_in_range(
        key in prop::collection::vec(any::<u8>(), 0..64),
        node_count in 1usize..10,
        method in arb_hash_method(),
        distribution in arb_distribution(),
    ) {
        let servers: Vec<String> = (0..node_count).map(|i| format!("cache-{i}:11211")).collect();
        let ring = HashRing::build(&servers, method, distribution);
        let hash = ring.hash_key(&key);
        prop_assert!(ring.node_for(hash) < node_count);
        // Same key, same node.
        prop_assert_eq!(ring.node_for(hash), ring.node_for(ring.hash_key(&key)));
    }

    #[test]
    fn ring_candidates_are_a_permutation(
        key in prop::collection::vec(any::<u8>(), 0..64),
        node_count in 1usize..10,
        method in arb_hash_method(),
        distribution in arb_distribution(),
    ) {
        let servers: Vec<String> = (0..node_count).map(|i| format!("cache-{i}:11211")).collect();
        let ring = HashRing::build(&servers, method, distribution);
        let mut order = ring.candidates(ring.hash_key(&key));
        order.sort_unstable();
        prop_assert_eq!(order, (0..node_count).collect::<Vec<_>>());
    }

    #[test]
    fn hash_tag_extraction_never_grows_the_key(
        key in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let narrowed = extract_hash_tag(&key, "{}");
        prop_assert!(narrowed.len() <= key.len());
    }
}
