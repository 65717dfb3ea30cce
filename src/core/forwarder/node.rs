// src/core/forwarder/node.rs

//! One backend cache server: a small idle-connection pool, lazy dialing, and
//! consecutive-failure ejection.

use crate::core::CitrineError;
use crate::core::protocol::ProxyCodec;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// How long an ejected node stays out of candidacy before a probe request is
/// allowed through again.
const EJECT_COOLDOWN: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 16 * 1024;

/// Per-request socket deadlines, taken from the cluster config. A zero
/// duration disables the deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
}

pub struct BackendNode {
    addr: String,
    pool: Mutex<Vec<TcpStream>>,
    pool_cap: usize,
    consecutive_failures: AtomicU32,
    ejected_until: Mutex<Option<Instant>>,
    ping_fail_limit: u32,
    ping_auto_eject: bool,
}

impl BackendNode {
    pub fn new(addr: String, pool_cap: usize, ping_fail_limit: u32, ping_auto_eject: bool) -> Self {
        Self {
            addr,
            pool: Mutex::new(Vec::new()),
            pool_cap,
            consecutive_failures: AtomicU32::new(0),
            ejected_until: Mutex::new(None),
            ping_fail_limit,
            ping_auto_eject,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// False while the node is ejected and its cooldown has not elapsed.
    pub fn is_available(&self) -> bool {
        match *self.ejected_until.lock() {
            None => true,
            Some(until) => Instant::now() >= until,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut ejected = self.ejected_until.lock();
        if ejected.take().is_some() {
            debug!("backend '{}' recovered, restored to the ring", self.addr);
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.ping_auto_eject && self.ping_fail_limit > 0 && failures >= self.ping_fail_limit {
            let mut ejected = self.ejected_until.lock();
            if ejected.is_none() {
                warn!(
                    "backend '{}' ejected after {} consecutive failures",
                    self.addr, failures
                );
            }
            *ejected = Some(Instant::now() + EJECT_COOLDOWN);
        }
    }

    /// Drops every pooled connection. Called exactly once, when the owning
    /// forwarder's last reference goes away.
    pub fn teardown(&self) {
        self.pool.lock().clear();
    }

    async fn checkout(
        &self,
        deadlines: Deadlines,
        auth_prelude: Option<&Bytes>,
        codec: &dyn ProxyCodec,
    ) -> Result<TcpStream, CitrineError> {
        if let Some(stream) = self.pool.lock().pop() {
            return Ok(stream);
        }

        let mut stream = io_deadline(deadlines.dial, self.addr(), "dial", async {
            TcpStream::connect(&self.addr).await
        })
        .await?;
        stream.set_nodelay(true)?;

        if let Some(prelude) = auth_prelude {
            io_deadline(deadlines.write, self.addr(), "auth write", async {
                stream.write_all(prelude).await
            })
            .await?;
            let reply = read_one_response(&mut stream, deadlines, &self.addr, codec).await?;
            if reply.starts_with(b"-") {
                return Err(CitrineError::Protocol(format!(
                    "backend '{}' rejected AUTH",
                    self.addr
                )));
            }
        }
        Ok(stream)
    }

    fn checkin(&self, stream: TcpStream) {
        let mut pool = self.pool.lock();
        if pool.len() < self.pool_cap {
            pool.push(stream);
        }
    }

    /// Relays one request: write the raw payload, then (unless the request is
    /// fire-and-forget) read exactly one framed response. The connection goes
    /// back to the pool only after a fully successful exchange.
    pub async fn relay(
        &self,
        payload: &Bytes,
        expects_reply: bool,
        deadlines: Deadlines,
        auth_prelude: Option<&Bytes>,
        codec: &dyn ProxyCodec,
    ) -> Result<Option<Bytes>, CitrineError> {
        let result = self
            .relay_inner(payload, expects_reply, deadlines, auth_prelude, codec)
            .await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    async fn relay_inner(
        &self,
        payload: &Bytes,
        expects_reply: bool,
        deadlines: Deadlines,
        auth_prelude: Option<&Bytes>,
        codec: &dyn ProxyCodec,
    ) -> Result<Option<Bytes>, CitrineError> {
        let mut stream = self.checkout(deadlines, auth_prelude, codec).await?;

        io_deadline(deadlines.write, self.addr(), "write", async {
            stream.write_all(payload).await?;
            stream.flush().await
        })
        .await?;

        if !expects_reply {
            self.checkin(stream);
            return Ok(None);
        }

        let response = read_one_response(&mut stream, deadlines, &self.addr, codec).await?;
        self.checkin(stream);
        Ok(Some(response))
    }
}

/// Reads from the socket until the codec can cut one complete response frame.
async fn read_one_response(
    stream: &mut TcpStream,
    deadlines: Deadlines,
    addr: &str,
    codec: &dyn ProxyCodec,
) -> Result<Bytes, CitrineError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some(response) = codec.frame_response(&mut buf)? {
            if !buf.is_empty() {
                // Leftover bytes would desynchronize a pooled connection.
                return Err(CitrineError::Protocol(format!(
                    "backend '{addr}' sent bytes past the response frame"
                )));
            }
            return Ok(response);
        }
        let read = io_deadline(deadlines.read, addr, "read", async {
            stream.read_buf(&mut buf).await
        })
        .await?;
        if read == 0 {
            return Err(CitrineError::Io(std::sync::Arc::new(
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("backend '{addr}' closed mid-response"),
                ),
            )));
        }
    }
}

/// Runs an I/O future under a deadline; a zero deadline disables it.
async fn io_deadline<T>(
    deadline: Duration,
    addr: &str,
    op: &'static str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, CitrineError> {
    if deadline.is_zero() {
        return fut.await.map_err(CitrineError::from);
    }
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(CitrineError::from),
        Err(_) => Err(CitrineError::BackendTimeout {
            addr: addr.to_string(),
            op,
        }),
    }
}
