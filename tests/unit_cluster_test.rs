// tests/unit_cluster_test.rs

use citrine::config::{CacheType, ClusterConfig, HashDistribution, HashMethod, ListenProto};
use citrine::core::CitrineError;
use citrine::core::cluster::{ClientConn, Cluster, next_sn};
use citrine::core::forwarder::ForwarderHandle;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn conf(name: &str, servers: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        id: 0,
        sn: 0,
        listen_proto: ListenProto::Tcp,
        listen_addr: "127.0.0.1:0".to_string(),
        cache_type: CacheType::Memcache,
        hash_method: HashMethod::Fnv1a64,
        hash_distribution: HashDistribution::Ketama,
        hash_tag: String::new(),
        redis_auth: None,
        dial_timeout: Duration::from_millis(500),
        read_timeout: Duration::ZERO,
        write_timeout: Duration::ZERO,
        node_connections: 2,
        ping_fail_limit: 0,
        ping_auto_eject: false,
        close_when_change: false,
        servers,
    }
}

/// Builds a running cluster the way the supervisor does: stamped config plus
/// a forwarder whose handle becomes the cluster's own reference.
fn cluster(name: &str) -> Cluster {
    let mut config = conf(name, vec!["a:11211".into(), "b:11211".into()]);
    config.sn = next_sn();
    let forwarder = ForwarderHandle::new(&config).unwrap();
    Cluster::new(config, forwarder, "127.0.0.1:0".to_string())
}

#[test]
fn test_add_connection_current_generation() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, _rx) = ClientConn::channel(1, "peer".into());
    cluster.add_connection(sn, conn).unwrap();
    assert_eq!(cluster.client_count(), 1);
}

#[test]
fn test_add_connection_stale_generation_rejected() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, _rx) = ClientConn::channel(1, "peer".into());
    let err = cluster.add_connection(sn - 1, conn).unwrap_err();
    assert!(matches!(err, CitrineError::StaleGeneration { .. }));
    assert_eq!(cluster.client_count(), 0);
}

#[test]
fn test_remove_connection_is_idempotent() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, _rx) = ClientConn::channel(1, "peer".into());
    cluster.add_connection(sn, conn).unwrap();
    cluster.remove_connection(1);
    cluster.remove_connection(1);
    cluster.remove_connection(99);
    assert_eq!(cluster.client_count(), 0);
}

#[test]
fn test_close_and_remove_signals_the_handler() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, mut rx) = ClientConn::channel(1, "peer".into());
    cluster.add_connection(sn, conn).unwrap();
    cluster.close_and_remove_connection(1);
    assert_eq!(cluster.client_count(), 0);
    assert!(rx.try_recv().is_ok());
}

#[test]
fn test_close_all_connections_closes_each_exactly_once() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let mut receivers = Vec::new();
    for id in 1..=3 {
        let (conn, rx) = ClientConn::channel(id, format!("peer-{id}"));
        cluster.add_connection(sn, conn).unwrap();
        receivers.push(rx);
    }

    cluster.close_all_connections();
    assert_eq!(cluster.client_count(), 0);

    for rx in &mut receivers {
        // Exactly one kill signal per connection.
        assert!(rx.try_recv().is_ok());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}

#[test]
fn test_client_conn_close_only_fires_once() {
    let (conn, mut rx) = ClientConn::channel(7, "peer".into());
    conn.close();
    conn.close();
    assert!(conn.is_closed());
    assert!(rx.try_recv().is_ok());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_conf_change_bumps_sn_and_keeps_id() {
    let cluster = cluster("mc");
    let before = cluster.conf();

    let mut next = conf("mc", vec!["c:11211".into()]);
    next.id = 42; // Deliberately wrong; the cluster must pin its own id.
    cluster.process_conf_change(next).unwrap();

    let after = cluster.conf();
    assert!(after.sn > before.sn);
    assert_eq!(after.id, before.id);
    assert_eq!(after.servers, vec!["c:11211".to_string()]);
}

#[test]
fn test_sn_strictly_increases_across_changes() {
    let cluster = cluster("mc");
    let mut last = cluster.conf().sn;
    for i in 0..5 {
        cluster
            .process_conf_change(conf("mc", vec![format!("n{i}:11211")]))
            .unwrap();
        let sn = cluster.conf().sn;
        assert!(sn > last);
        last = sn;
    }
}

#[test]
fn test_conf_change_swaps_and_retires_the_forwarder() {
    let cluster = cluster("mc");
    let held = cluster.forwarder();
    // Cluster's own reference plus ours.
    assert_eq!(held.ref_count(), 2);

    cluster
        .process_conf_change(conf("mc", vec!["c:11211".into()]))
        .unwrap();

    // The displaced forwarder is draining and we are its last holder.
    assert!(held.is_closed());
    assert_eq!(held.ref_count(), 1);

    let fresh = cluster.forwarder();
    assert!(!fresh.is_closed());
}

#[test]
fn test_conf_change_failure_leaves_cluster_untouched() {
    let cluster = cluster("mc");
    let before_sn = cluster.conf().sn;
    let held = cluster.forwarder();

    let err = cluster
        .process_conf_change(conf("mc", vec!["not-an-endpoint".into()]))
        .unwrap_err();
    assert!(matches!(err, CitrineError::Config(_)));

    assert_eq!(cluster.conf().sn, before_sn);
    assert!(!held.is_closed());
}

#[test]
fn test_conf_change_without_close_flag_keeps_clients() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, mut rx) = ClientConn::channel(1, "peer".into());
    cluster.add_connection(sn, conn).unwrap();

    cluster
        .process_conf_change(conf("mc", vec!["c:11211".into()]))
        .unwrap();

    assert_eq!(cluster.client_count(), 1);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_conf_change_with_close_flag_drops_clients() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let mut receivers = Vec::new();
    for id in 1..=2 {
        let (conn, rx) = ClientConn::channel(id, format!("peer-{id}"));
        cluster.add_connection(sn, conn).unwrap();
        receivers.push(rx);
    }

    let mut next = conf("mc", vec!["c:11211".into()]);
    next.close_when_change = true;
    cluster.process_conf_change(next).unwrap();

    assert_eq!(cluster.client_count(), 0);
    for rx in &mut receivers {
        assert!(rx.try_recv().is_ok());
    }
}

#[test]
fn test_stale_admission_after_change() {
    let cluster = cluster("mc");
    let old_sn = cluster.conf().sn;
    cluster
        .process_conf_change(conf("mc", vec!["c:11211".into()]))
        .unwrap();

    let (conn, _rx) = ClientConn::channel(1, "peer".into());
    let err = cluster.add_connection(old_sn, conn).unwrap_err();
    assert!(matches!(err, CitrineError::StaleGeneration { .. }));
}

#[test]
fn test_concurrent_swaps_never_break_a_reader() {
    let cluster = std::sync::Arc::new(cluster("mc"));
    let initial_sn = cluster.conf().sn;
    let mut workers = Vec::new();

    for writer in 0..4 {
        let cluster = std::sync::Arc::clone(&cluster);
        workers.push(std::thread::spawn(move || {
            for round in 0..50 {
                cluster
                    .process_conf_change(conf("mc", vec![format!("n{writer}-{round}:11211")]))
                    .unwrap();
            }
        }));
    }
    for _ in 0..4 {
        let cluster = std::sync::Arc::clone(&cluster);
        workers.push(std::thread::spawn(move || {
            for _ in 0..500 {
                let handle = cluster.forwarder();
                // A handle taken under the lock always owns a live reference,
                // no matter how many swaps race with it.
                assert!(handle.ref_count() >= 1);
                drop(handle);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(cluster.conf().sn >= initial_sn + 200);
    // Only the cluster's own reference plus ours remains.
    assert_eq!(cluster.forwarder().ref_count(), 2);
}

#[test]
fn test_close_is_terminal() {
    let cluster = cluster("mc");
    let sn = cluster.conf().sn;
    let (conn, mut rx) = ClientConn::channel(1, "peer".into());
    cluster.add_connection(sn, conn).unwrap();

    let held = cluster.forwarder();
    cluster.close();

    assert!(cluster.is_closed());
    assert!(held.is_closed());
    assert!(rx.try_recv().is_ok());

    let (conn, _rx) = ClientConn::channel(2, "peer".into());
    assert!(matches!(
        cluster.add_connection(sn, conn),
        Err(CitrineError::ClusterClosed)
    ));
    assert!(matches!(
        cluster.process_conf_change(conf("mc", vec!["d:11211".into()])),
        Err(CitrineError::ClusterClosed)
    ));
}
