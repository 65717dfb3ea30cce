// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::cluster::Cluster;
use crate::core::supervisor::Supervisor;
use std::sync::Arc;
use tracing::debug;

/// An RAII guard that unregisters a connection when its handler's scope is
/// exited, on every exit path: it extracts the connection from the cluster's
/// live set and releases its slot in the process-wide connection count.
pub struct ConnectionGuard {
    sup: Arc<Supervisor>,
    cluster: Arc<Cluster>,
    conn_id: u64,
    peer: String,
}

impl ConnectionGuard {
    pub(crate) fn new(
        sup: Arc<Supervisor>,
        cluster: Arc<Cluster>,
        conn_id: u64,
        peer: String,
    ) -> Self {
        Self {
            sup,
            cluster,
            conn_id,
            peer,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        debug!(
            "cleaning up connection {} from {} on cluster '{}'",
            self.conn_id,
            self.peer,
            self.cluster.name()
        );
        self.cluster.close_and_remove_connection(self.conn_id);
        self.sup.conn_released();
    }
}
