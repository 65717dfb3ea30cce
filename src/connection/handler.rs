// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a
//! client connection.

use super::guard::ConnectionGuard;
use crate::config::ClusterConfig;
use crate::core::CitrineError;
use crate::core::cluster::Cluster;
use crate::core::protocol::{ProxyCodec, Request, codec_for};
use crate::core::supervisor::Supervisor;
use crate::server::AnyStream;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Manages the full lifecycle of a client connection.
///
/// The codec and the socket deadlines are fixed at admission time from the
/// config generation the connection was accepted under; a later hot swap
/// changes where requests go (the next `forwarder()` call returns the new
/// one) but not how this connection's bytes are framed.
pub struct ConnectionHandler {
    stream: AnyStream,
    buf: BytesMut,
    codec: Box<dyn ProxyCodec>,
    peer: String,
    sup: Arc<Supervisor>,
    cluster: Arc<Cluster>,
    conn_id: u64,
    read_timeout: Duration,
    write_timeout: Duration,
    kill_rx: broadcast::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: AnyStream,
        peer: String,
        sup: Arc<Supervisor>,
        cluster: Arc<Cluster>,
        conf: Arc<ClusterConfig>,
        conn_id: u64,
        kill_rx: broadcast::Receiver<()>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4 * 1024),
            codec: codec_for(conf.cache_type),
            peer,
            sup,
            cluster,
            conn_id,
            read_timeout: conf.read_timeout,
            write_timeout: conf.write_timeout,
            kill_rx,
            shutdown_rx,
        }
    }

    /// The main event loop for the connection: frame a request, dispatch it
    /// through the cluster's current forwarder, relay the response.
    pub async fn run(mut self) -> Result<(), CitrineError> {
        let _guard = ConnectionGuard::new(
            Arc::clone(&self.sup),
            Arc::clone(&self.cluster),
            self.conn_id,
            self.peer.clone(),
        );

        loop {
            tokio::select! {
                // Prioritize shutdown and kill signals over client traffic.
                biased;

                _ = self.shutdown_rx.recv() => {
                    debug!("connection {} from {} closing on shutdown", self.conn_id, self.peer);
                    return Ok(());
                }

                _ = self.kill_rx.recv() => {
                    debug!("connection {} from {} killed by its cluster", self.conn_id, self.peer);
                    return Ok(());
                }

                result = read_one_request(
                    &mut self.stream,
                    &mut self.buf,
                    self.codec.as_ref(),
                    self.read_timeout,
                ) => {
                    match result {
                        Ok(Some(request)) => self.dispatch(request).await?,
                        Ok(None) => {
                            debug!("connection from {} closed by peer", self.peer);
                            return Ok(());
                        }
                        Err(e @ CitrineError::Protocol(_)) => {
                            // The stream may be desynchronized; answer and close.
                            self.send_error(&e).await.ok();
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Forwards one request. The forwarder handle is taken fresh from the
    /// cluster for every request cycle and released at the end of it, which
    /// is what lets a hot swap retire the old forwarder underneath us.
    async fn dispatch(&mut self, request: Request) -> Result<(), CitrineError> {
        let forwarder = self.cluster.forwarder();
        match forwarder.forward(&request).await {
            Ok(Some(response)) => self.write_response(&response).await?,
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "cluster '{}': request from {} failed: {}",
                    self.cluster.name(),
                    self.peer,
                    e
                );
                // The client keeps its connection; it sees a framed error and
                // may retry.
                self.send_error(&e).await?;
            }
        }
        Ok(())
    }

    async fn write_response(&mut self, response: &[u8]) -> Result<(), CitrineError> {
        let write = async {
            self.stream.write_all(response).await?;
            self.stream.flush().await
        };
        if self.write_timeout.is_zero() {
            write.await?;
        } else {
            tokio::time::timeout(self.write_timeout, write)
                .await
                .map_err(|_| {
                    CitrineError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "client write timed out",
                    )))
                })??;
        }
        Ok(())
    }

    async fn send_error(&mut self, e: &CitrineError) -> Result<(), CitrineError> {
        let mut buf = BytesMut::new();
        self.codec.encode_error(&e.to_string(), &mut buf);
        self.write_response(&buf).await
    }
}

/// Reads from the client until the codec can cut one complete request.
/// Returns `None` on a clean EOF between requests.
async fn read_one_request(
    stream: &mut AnyStream,
    buf: &mut BytesMut,
    codec: &dyn ProxyCodec,
    read_timeout: Duration,
) -> Result<Option<Request>, CitrineError> {
    loop {
        if let Some(request) = codec.frame_request(buf)? {
            return Ok(Some(request));
        }
        let read = async { stream.read_buf(buf).await };
        let count = if read_timeout.is_zero() {
            read.await?
        } else {
            tokio::time::timeout(read_timeout, read)
                .await
                .map_err(|_| {
                    CitrineError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "client read timed out",
                    )))
                })??
        };
        if count == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(CitrineError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed mid-request",
            ))));
        }
    }
}
