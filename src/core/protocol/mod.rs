// src/core/protocol/mod.rs

//! Minimal wire codecs for the protocols the proxy fronts.
//!
//! The proxy relays bytes; it never interprets values. A codec only has to do
//! three things: cut one complete client request out of a read buffer (and
//! name its routing key), cut one complete backend response, and write a
//! single protocol-framed error message.

pub mod memcache;
pub mod memcache_bin;
pub mod resp;

pub use memcache::MemcacheTextCodec;
pub use memcache_bin::MemcacheBinaryCodec;
pub use resp::RespCodec;

use crate::config::CacheType;
use crate::core::CitrineError;
use bytes::{Bytes, BytesMut};

/// One complete client request, cut from the read buffer.
#[derive(Debug, Clone)]
pub struct Request {
    /// The raw request bytes, relayed to a backend verbatim.
    pub payload: Bytes,
    /// The routing key. Multi-key requests route by their first key.
    pub key: Bytes,
    /// False for fire-and-forget requests (memcache `noreply`, quiet binary
    /// opcodes); the proxy does not wait for a backend response.
    pub expects_reply: bool,
}

/// The codec capability the dispatch core needs, one implementation per
/// [`CacheType`].
pub trait ProxyCodec: Send + Sync {
    /// Cuts one complete request off the front of `src`, or returns `None`
    /// if the buffer does not yet hold a full request.
    fn frame_request(&self, src: &mut BytesMut) -> Result<Option<Request>, CitrineError>;

    /// Cuts one complete response off the front of `src`.
    fn frame_response(&self, src: &mut BytesMut) -> Result<Option<Bytes>, CitrineError>;

    /// Appends a single protocol-framed error message to `dst`.
    fn encode_error(&self, msg: &str, dst: &mut BytesMut);
}

/// Returns the codec for a cluster's cache type.
pub fn codec_for(cache_type: CacheType) -> Box<dyn ProxyCodec> {
    match cache_type {
        CacheType::Memcache => Box::new(MemcacheTextCodec),
        CacheType::MemcacheBinary => Box::new(MemcacheBinaryCodec),
        CacheType::Redis | CacheType::RedisCluster => Box::new(RespCodec),
    }
}
