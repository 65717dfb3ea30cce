// src/core/cluster.rs

//! One logical tenant of the proxy: a listener's config, its current
//! forwarder, and its live client connections.
//!
//! A single mutex guards all three as a unit. It is held only for O(1)
//! pointer and map operations; everything that can block (forwarder
//! construction, connection close, socket I/O) happens outside it. The
//! forwarder swap in [`Cluster::process_conf_change`] relies on
//! [`Cluster::forwarder`] cloning the handle *before* the lock is released,
//! so a displaced forwarder can never lose its last reference while a reader
//! is still taking one.

use crate::config::ClusterConfig;
use crate::core::CitrineError;
use crate::core::forwarder::ForwarderHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Process-wide generation counter. Every cluster creation and every applied
/// config change stamps a fresh value, so generations are unique and strictly
/// increasing across all clusters for the process lifetime.
static CLUSTER_SN: AtomicU64 = AtomicU64::new(0);

pub fn next_sn() -> u64 {
    CLUSTER_SN.fetch_add(1, Ordering::SeqCst) + 1
}

/// A live client connection as the cluster tracks it: an id plus a kill
/// signal into its handler. Closing is idempotent and observable.
pub struct ClientConn {
    id: u64,
    peer: String,
    kill_tx: broadcast::Sender<()>,
    closed: Arc<AtomicBool>,
}

impl ClientConn {
    /// Creates the tracking handle and the kill receiver its handler selects
    /// on.
    pub fn channel(id: u64, peer: String) -> (Self, broadcast::Receiver<()>) {
        let (kill_tx, kill_rx) = broadcast::channel(1);
        (
            Self {
                id,
                peer,
                kill_tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            kill_rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signals the handler to tear the connection down. Only the first call
    /// sends; repeats are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.kill_tx.send(());
        }
    }
}

struct ClusterShared {
    conf: Arc<ClusterConfig>,
    forwarder: ForwarderHandle,
    clients: HashMap<u64, ClientConn>,
}

/// Runtime record for one cluster. Created once per registry slot and never
/// removed; `close` is terminal.
pub struct Cluster {
    id: usize,
    name: String,
    /// The address the listener actually bound (resolves `:0` ports).
    bound_addr: String,
    closed: AtomicBool,
    shared: Mutex<ClusterShared>,
}

impl Cluster {
    /// Wraps an already-stamped config (id and sn assigned by the caller) and
    /// the forwarder built for it. The forwarder handle passed in becomes the
    /// cluster's own reference.
    pub fn new(conf: ClusterConfig, forwarder: ForwarderHandle, bound_addr: String) -> Self {
        Self {
            id: conf.id,
            name: conf.name.clone(),
            bound_addr,
            closed: AtomicBool::new(false),
            shared: Mutex::new(ClusterShared {
                conf: Arc::new(conf),
                forwarder,
                clients: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bound_addr(&self) -> &str {
        &self.bound_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the current config. Treated as immutable by callers.
    pub fn conf(&self) -> Arc<ClusterConfig> {
        self.shared.lock().conf.clone()
    }

    /// The number of tracked client connections.
    pub fn client_count(&self) -> usize {
        self.shared.lock().clients.len()
    }

    /// A counted reference to the current forwarder. The clone (reference
    /// acquisition) happens while the lock is held; a concurrent
    /// `process_conf_change` can therefore never observe the handle at its
    /// last reference while we are taking one.
    pub fn forwarder(&self) -> ForwarderHandle {
        self.shared.lock().forwarder.clone()
    }

    /// Admits a connection into the live set, but only if it was accepted
    /// under the current config generation. A stale generation means a reload
    /// won the race with the accept loop; the caller closes the socket.
    pub fn add_connection(&self, sn: u64, conn: ClientConn) -> Result<(), CitrineError> {
        if self.is_closed() {
            return Err(CitrineError::ClusterClosed);
        }
        let mut shared = self.shared.lock();
        if shared.conf.sn != sn {
            return Err(CitrineError::StaleGeneration {
                got: sn,
                current: shared.conf.sn,
            });
        }
        shared.clients.insert(conn.id, conn);
        Ok(())
    }

    /// Idempotent delete from the live set.
    pub fn remove_connection(&self, id: u64) {
        self.shared.lock().clients.remove(&id);
    }

    /// Extracts a connection under the lock and closes it outside.
    pub fn close_and_remove_connection(&self, id: u64) {
        let conn = self.shared.lock().clients.remove(&id);
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Swaps the live set for an empty one under the lock, then closes the
    /// extracted connections outside it, so concurrent admissions are never
    /// stalled behind connection teardown.
    pub fn close_all_connections(&self) {
        let extracted = {
            let mut shared = self.shared.lock();
            std::mem::take(&mut shared.clients)
        };
        for conn in extracted.values() {
            conn.close();
        }
    }

    /// Atomically replaces the cluster's forwarder and config.
    ///
    /// The new forwarder is built before the lock is taken; a construction
    /// failure leaves the cluster untouched on its previous generation. The
    /// displaced forwarder is closed and released after the lock is dropped;
    /// handlers still holding references keep it alive until they finish.
    pub fn process_conf_change(&self, mut new_conf: ClusterConfig) -> Result<(), CitrineError> {
        if self.is_closed() {
            return Err(CitrineError::ClusterClosed);
        }

        new_conf.id = self.id;
        new_conf.sn = next_sn();
        let close_clients = new_conf.close_when_change;

        let new_forwarder = ForwarderHandle::new(&new_conf)?;

        let (old_forwarder, old_clients) = {
            let mut shared = self.shared.lock();
            let old_forwarder = std::mem::replace(&mut shared.forwarder, new_forwarder);
            shared.conf = Arc::new(new_conf);
            let old_clients = if close_clients {
                std::mem::take(&mut shared.clients)
            } else {
                HashMap::new()
            };
            (old_forwarder, old_clients)
        };

        old_forwarder.close();
        drop(old_forwarder);

        if close_clients {
            info!(
                "cluster '{}': closing {} client connections after config change",
                self.name,
                old_clients.len()
            );
            for conn in old_clients.values() {
                conn.close();
            }
        }

        let shared = self.shared.lock();
        debug!(
            "cluster '{}' now at generation {} with {} backends",
            self.name,
            shared.conf.sn,
            shared.conf.servers.len()
        );
        Ok(())
    }

    /// Terminal: closes the current forwarder and every client connection.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let extracted = {
            let mut shared = self.shared.lock();
            shared.forwarder.close();
            std::mem::take(&mut shared.clients)
        };
        for conn in extracted.values() {
            conn.close();
        }
        info!("cluster '{}' closed", self.name);
    }
}
