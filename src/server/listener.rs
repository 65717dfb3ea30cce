// src/server/listener.rs

//! Listener wrappers for the transports a cluster can bind.

use super::stream::AnyStream;
use crate::config::ListenProto;
use std::io;
use tokio::net::{TcpListener, UnixListener};

/// A bound cluster listener, TCP or Unix domain socket.
pub enum AnyListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: String },
}

impl AnyListener {
    pub async fn bind(proto: ListenProto, addr: &str) -> io::Result<Self> {
        match proto {
            ListenProto::Tcp => Ok(AnyListener::Tcp(TcpListener::bind(addr).await?)),
            ListenProto::Unix => {
                // A previous run may have left the socket file behind.
                if std::path::Path::new(addr).exists() {
                    std::fs::remove_file(addr)?;
                }
                Ok(AnyListener::Unix {
                    listener: UnixListener::bind(addr)?,
                    path: addr.to_string(),
                })
            }
        }
    }

    /// The address actually bound; resolves `:0` TCP ports.
    pub fn local_addr(&self) -> String {
        match self {
            AnyListener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            AnyListener::Unix { path, .. } => path.clone(),
        }
    }

    /// Accepts one connection, returning the stream and a peer description
    /// for logs.
    pub async fn accept(&self) -> io::Result<(AnyStream, String)> {
        match self {
            AnyListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((AnyStream::Tcp(stream), addr.to_string()))
            }
            AnyListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((AnyStream::Unix(stream), format!("unix:{path}")))
            }
        }
    }
}
