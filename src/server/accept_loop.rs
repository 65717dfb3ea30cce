// src/server/accept_loop.rs

//! The per-cluster accept loop: admission control and handler spawning.

use super::listener::AnyListener;
use super::stream::AnyStream;
use crate::config::CacheType;
use crate::connection::ConnectionHandler;
use crate::core::CitrineError;
use crate::core::cluster::{ClientConn, Cluster};
use crate::core::protocol::codec_for;
use crate::core::supervisor::Supervisor;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Accepts connections for one cluster until the supervisor shuts down.
///
/// Each accepted connection is tagged with the config generation that was
/// current at admission time; if a reload lands between `accept` and
/// `add_connection`, the stale-generation rejection closes the socket and the
/// loop moves on.
pub async fn run(
    sup: Arc<Supervisor>,
    cluster: Arc<Cluster>,
    listener: AnyListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut conn_id: u64 = 0;
    loop {
        let conf = cluster.conf();
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("accept loop for cluster '{}' shutting down", cluster.name());
                return;
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if sup.is_closed() {
                            return;
                        }
                        // Listeners survive transient accept errors.
                        error!("cluster '{}': accept failed: {}", cluster.name(), e);
                        continue;
                    }
                };

                sup.stats.incr_connections_received();
                let count = sup.conn_admitted();
                let max = sup.max_connections();
                if max > 0 && count > max {
                    sup.conn_released();
                    sup.stats.incr_connections_rejected();
                    warn!(
                        "cluster '{}': rejecting {} ({} connections, cap {})",
                        cluster.name(), peer, count, max
                    );
                    tokio::spawn(reject_over_limit(stream, conf.cache_type));
                    continue;
                }

                conn_id += 1;
                let (conn, kill_rx) = ClientConn::channel(conn_id, peer.clone());
                if let Err(e) = cluster.add_connection(conf.sn, conn) {
                    // A reload won the race with this accept; the client will
                    // simply reconnect under the new generation.
                    debug!("cluster '{}': dropping {}: {}", cluster.name(), peer, e);
                    sup.conn_released();
                    continue;
                }

                debug!("cluster '{}': accepted {} (conn {})", cluster.name(), peer, conn_id);
                let handler = ConnectionHandler::new(
                    stream,
                    peer.clone(),
                    Arc::clone(&sup),
                    Arc::clone(&cluster),
                    conf.clone(),
                    conn_id,
                    kill_rx,
                    sup.subscribe_shutdown(),
                );
                tokio::spawn(async move {
                    if let Err(e) = handler.run().await {
                        if e.is_normal_disconnect() {
                            debug!("connection from {} closed by peer: {}", peer, e);
                        } else {
                            warn!("connection from {} terminated: {}", peer, e);
                        }
                    }
                });
            }
        }
    }
}

/// Writes a single protocol-framed "too many connections" error and closes
/// the socket, so the client sees a readable refusal instead of a bare reset.
async fn reject_over_limit(mut stream: AnyStream, cache_type: CacheType) {
    let codec = codec_for(cache_type);
    let mut buf = BytesMut::new();
    codec.encode_error(&CitrineError::MaxConnectionsReached.to_string(), &mut buf);
    let _ = stream.write_all(&buf).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
