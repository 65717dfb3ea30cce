// tests/unit_forwarder_test.rs

use bytes::Bytes;
use citrine::config::{CacheType, ClusterConfig, HashDistribution, HashMethod, ListenProto};
use citrine::core::CitrineError;
use citrine::core::forwarder::ForwarderHandle;
use citrine::core::protocol::Request;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

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
        read_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        node_connections: 2,
        ping_fail_limit: 0,
        ping_auto_eject: false,
        close_when_change: false,
        servers,
    }
}

fn get_request(key: &str) -> Request {
    Request {
        payload: Bytes::from(format!("get {key}\r\n")),
        key: Bytes::from(key.to_string()),
        expects_reply: true,
    }
}

/// A scripted memcache backend: every `get` answers `END`, every `set`
/// swallows its data block and answers `STORED`.
async fn spawn_memcache_backend() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if line.starts_with("get") {
                        if write_half.write_all(b"END\r\n").await.is_err() {
                            return;
                        }
                    } else if line.starts_with("set") {
                        let mut data = String::new();
                        let _ = reader.read_line(&mut data).await;
                        if !line.trim_end().ends_with("noreply")
                            && write_half.write_all(b"STORED\r\n").await.is_err()
                        {
                            return;
                        }
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Binds and immediately drops a listener, yielding an address that refuses
/// connections.
async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[test]
fn test_refcount_clone_and_drop() {
    let forwarder = ForwarderHandle::new(&conf("mc", vec!["a:11211".into()])).unwrap();
    assert_eq!(forwarder.ref_count(), 1);
    let second = forwarder.clone();
    assert_eq!(forwarder.ref_count(), 2);
    drop(second);
    assert_eq!(forwarder.ref_count(), 1);
}

#[test]
fn test_close_is_idempotent() {
    let forwarder = ForwarderHandle::new(&conf("mc", vec!["a:11211".into()])).unwrap();
    assert!(!forwarder.is_closed());
    forwarder.close();
    forwarder.close();
    assert!(forwarder.is_closed());
}

#[test]
fn test_clones_observe_close() {
    let forwarder = ForwarderHandle::new(&conf("mc", vec!["a:11211".into()])).unwrap();
    let clone = forwarder.clone();
    forwarder.close();
    assert!(clone.is_closed());
}

#[test]
fn test_malformed_backend_rejected() {
    for bad in ["noport", "host:", ":11211x", "host:notaport"] {
        assert!(matches!(
            ForwarderHandle::new(&conf("mc", vec![bad.into()])),
            Err(CitrineError::Config(_))
        ));
    }
}

#[tokio::test]
async fn test_forward_after_close_fails() {
    let forwarder = ForwarderHandle::new(&conf("mc", vec!["a:11211".into()])).unwrap();
    forwarder.close();
    let err = forwarder.forward(&get_request("foo")).await.unwrap_err();
    assert!(matches!(err, CitrineError::ForwarderClosed));
}

#[tokio::test]
async fn test_forward_get_roundtrip() {
    let (addr, backend) = spawn_memcache_backend().await;
    let forwarder = ForwarderHandle::new(&conf("mc", vec![addr])).unwrap();

    let response = forwarder.forward(&get_request("foo")).await.unwrap();
    assert_eq!(&response.unwrap()[..], b"END\r\n");

    // A second exchange reuses the pooled backend connection.
    let response = forwarder.forward(&get_request("bar")).await.unwrap();
    assert_eq!(&response.unwrap()[..], b"END\r\n");

    backend.abort();
}

#[tokio::test]
async fn test_forward_noreply_returns_nothing() {
    let (addr, backend) = spawn_memcache_backend().await;
    let forwarder = ForwarderHandle::new(&conf("mc", vec![addr])).unwrap();

    let request = Request {
        payload: Bytes::from_static(b"set foo 0 0 2 noreply\r\nhi\r\n"),
        key: Bytes::from_static(b"foo"),
        expects_reply: false,
    };
    assert!(forwarder.forward(&request).await.unwrap().is_none());

    backend.abort();
}

#[tokio::test]
async fn test_forward_falls_through_to_live_node() {
    let (live, backend) = spawn_memcache_backend().await;
    let dead = dead_addr().await;
    let forwarder = ForwarderHandle::new(&conf("mc", vec![dead, live])).unwrap();

    // Whichever node the key prefers, a dead preferred node falls through to
    // the live one.
    for key in ["a", "b", "c", "d"] {
        let response = forwarder.forward(&get_request(key)).await.unwrap();
        assert_eq!(&response.unwrap()[..], b"END\r\n");
    }

    backend.abort();
}

#[tokio::test]
async fn test_auto_eject_takes_dead_node_out() {
    let dead = dead_addr().await;
    let mut config = conf("mc", vec![dead]);
    config.ping_fail_limit = 1;
    config.ping_auto_eject = true;
    config.dial_timeout = Duration::from_millis(200);
    let forwarder = ForwarderHandle::new(&config).unwrap();

    // First dispatch fails against the socket and trips the eject limit.
    assert!(forwarder.forward(&get_request("foo")).await.is_err());

    // The node is now out of candidacy entirely.
    let err = forwarder.forward(&get_request("foo")).await.unwrap_err();
    assert!(matches!(err, CitrineError::NoBackendAvailable(_)));
}
