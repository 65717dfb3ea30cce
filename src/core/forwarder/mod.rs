// src/core/forwarder/mod.rs

//! The forwarder: owns a cluster's backend connections and dispatches
//! requests onto them under the configured hashing policy.
//!
//! Hot-swap safety rests on the handle's reference count. The owning cluster
//! holds one reference while a forwarder is current; every request cycle
//! clones the handle (under the cluster lock) and drops it when done. A
//! superseded forwarder therefore lives exactly as long as its last user,
//! and backend teardown runs exactly once, on the final drop.

mod node;
mod ring;

pub use node::{BackendNode, Deadlines};
pub use ring::{HashRing, extract_hash_tag};

use crate::config::{CacheType, ClusterConfig};
use crate::core::CitrineError;
use crate::core::protocol::{ProxyCodec, Request, codec_for, resp};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

struct ForwarderInner {
    cluster_name: String,
    ring: HashRing,
    nodes: Vec<BackendNode>,
    codec: Box<dyn ProxyCodec>,
    deadlines: Deadlines,
    hash_tag: String,
    auth_prelude: Option<Bytes>,
    refs: AtomicUsize,
    closed: AtomicBool,
    torn_down: AtomicBool,
}

/// A counted reference to a forwarder. `Clone` acquires, `Drop` releases;
/// the drop of the last reference tears down the backend pools.
pub struct ForwarderHandle {
    inner: Arc<ForwarderInner>,
}

impl ForwarderHandle {
    /// Builds a forwarder for a cluster config. Validates the server list and
    /// builds the ring; backend sockets are dialed lazily on first dispatch,
    /// so construction never blocks existing traffic.
    pub fn new(conf: &ClusterConfig) -> Result<Self, CitrineError> {
        if conf.servers.is_empty() {
            return Err(CitrineError::Config(format!(
                "cluster '{}' has no backend servers",
                conf.name
            )));
        }
        for server in &conf.servers {
            let (host, port) = server.rsplit_once(':').ok_or_else(|| {
                CitrineError::Config(format!(
                    "cluster '{}': backend '{server}' is not host:port",
                    conf.name
                ))
            })?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(CitrineError::Config(format!(
                    "cluster '{}': backend '{server}' is not host:port",
                    conf.name
                )));
            }
        }

        let auth_prelude = match (&conf.redis_auth, conf.cache_type) {
            (Some(password), CacheType::Redis | CacheType::RedisCluster) => {
                Some(resp::encode_auth_command(password))
            }
            (Some(_), _) => {
                warn!(
                    "cluster '{}': redis_auth is ignored for cache_type {}",
                    conf.name, conf.cache_type
                );
                None
            }
            (None, _) => None,
        };

        let nodes = conf
            .servers
            .iter()
            .map(|server| {
                BackendNode::new(
                    server.clone(),
                    conf.node_connections,
                    conf.ping_fail_limit,
                    conf.ping_auto_eject,
                )
            })
            .collect();

        Ok(Self {
            inner: Arc::new(ForwarderInner {
                cluster_name: conf.name.clone(),
                ring: HashRing::build(&conf.servers, conf.hash_method, conf.hash_distribution),
                nodes,
                codec: codec_for(conf.cache_type),
                deadlines: Deadlines {
                    dial: conf.dial_timeout,
                    read: conf.read_timeout,
                    write: conf.write_timeout,
                },
                hash_tag: conf.hash_tag.clone(),
                auth_prelude,
                refs: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
        })
    }

    /// Marks the forwarder as draining: in-flight dispatches finish, new ones
    /// fail with [`CitrineError::ForwarderClosed`]. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("forwarder for cluster '{}' draining", self.inner.cluster_name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The current reference count; observable for tests.
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Dispatches one framed request to the backend owning its key and
    /// returns the raw response bytes (`None` for fire-and-forget requests).
    /// Falls through to the next ring candidate when a node is ejected or the
    /// exchange fails.
    pub async fn forward(&self, request: &Request) -> Result<Option<Bytes>, CitrineError> {
        if self.is_closed() {
            return Err(CitrineError::ForwarderClosed);
        }

        let inner = &self.inner;
        let hashed = extract_hash_tag(&request.key, &inner.hash_tag);
        let hash = inner.ring.hash_key(hashed);

        let mut last_error = None;
        for candidate in inner.ring.candidates(hash) {
            let node = &inner.nodes[candidate];
            if !node.is_available() {
                continue;
            }
            match node
                .relay(
                    &request.payload,
                    request.expects_reply,
                    inner.deadlines,
                    inner.auth_prelude.as_ref(),
                    inner.codec.as_ref(),
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(
                        "cluster '{}': backend '{}' failed: {}",
                        inner.cluster_name,
                        node.addr(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CitrineError::NoBackendAvailable(inner.cluster_name.clone())))
    }
}

impl Clone for ForwarderHandle {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.inner.torn_down.swap(true, Ordering::AcqRel)
        {
            debug!(
                "last reference to forwarder for cluster '{}' dropped, tearing down backend pools",
                self.inner.cluster_name
            );
            for node in &self.inner.nodes {
                node.teardown();
            }
        }
    }
}

impl std::fmt::Debug for ForwarderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderHandle")
            .field("cluster", &self.inner.cluster_name)
            .field("refs", &self.ref_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
