// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations. `std::io::Error` is wrapped in an `Arc` so the enum
/// stays cheaply cloneable.
#[derive(Error, Debug, Clone)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("proxy reached max client connections")]
    MaxConnectionsReached,

    /// The connection was accepted under a configuration generation that a
    /// concurrent reload has already displaced.
    #[error("connection admitted under stale generation {got}, current is {current}")]
    StaleGeneration { got: u64, current: u64 },

    #[error("forwarder is shutting down")]
    ForwarderClosed,

    #[error("cluster is closed")]
    ClusterClosed,

    #[error("cluster registry is full ({0} slots)")]
    TooManyClusters(usize),

    #[error("no reachable backend node for cluster '{0}'")]
    NoBackendAvailable(String),

    #[error("backend '{addr}' timed out during {op}")]
    BackendTimeout { addr: String, op: &'static str },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CitrineError {
    fn from(e: std::io::Error) -> Self {
        CitrineError::Io(Arc::new(e))
    }
}

impl From<String> for CitrineError {
    fn from(s: String) -> Self {
        CitrineError::Internal(s)
    }
}

impl CitrineError {
    /// True for errors that merely mean the peer went away, as opposed to a
    /// fault worth logging loudly.
    pub fn is_normal_disconnect(&self) -> bool {
        matches!(self, CitrineError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ))
    }
}
