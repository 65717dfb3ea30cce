// src/core/protocol/memcache_bin.rs

//! Framing for the memcached binary protocol.
//!
//! Every frame is a fixed 24-byte header followed by `total_body_length`
//! bytes, which makes framing a pure length computation. The key sits inside
//! the body after the extras section.

use super::{ProxyCodec, Request};
use crate::core::CitrineError;
use bytes::{BufMut, Bytes, BytesMut};

const HEADER_LEN: usize = 24;
const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;
const STATUS_INTERNAL_ERROR: u16 = 0x0084;

const MAX_BODY_SIZE: usize = 512 * 1024 * 1024;

/// Quiet opcodes suppress the success response; the proxy must not wait for
/// one. (GetQ, GetKQ, SetQ, AddQ, ReplaceQ, DeleteQ, IncrementQ, DecrementQ,
/// QuitQ, FlushQ, AppendQ, PrependQ.)
const QUIET_OPCODES: &[u8] = &[
    0x09, 0x0d, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a,
];

pub struct MemcacheBinaryCodec;

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Returns the total frame length once the header is available, validating
/// the magic byte.
fn frame_len(src: &[u8], magic: u8) -> Result<Option<usize>, CitrineError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    if src[0] != magic {
        return Err(CitrineError::Protocol(format!(
            "bad memcache binary magic byte 0x{:02x}",
            src[0]
        )));
    }
    let body_len = read_u32(src, 8) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(CitrineError::Protocol(
            "memcache binary body exceeds maximum size".to_string(),
        ));
    }
    Ok(Some(HEADER_LEN + body_len))
}

impl ProxyCodec for MemcacheBinaryCodec {
    fn frame_request(&self, src: &mut BytesMut) -> Result<Option<Request>, CitrineError> {
        let Some(total) = frame_len(src, MAGIC_REQUEST)? else {
            return Ok(None);
        };
        if src.len() < total {
            return Ok(None);
        }

        let opcode = src[1];
        let key_len = read_u16(src, 2) as usize;
        let extras_len = src[4] as usize;
        let key_start = HEADER_LEN + extras_len;
        if key_start + key_len > total {
            return Err(CitrineError::Protocol(
                "memcache binary key extends past the body".to_string(),
            ));
        }
        let key = Bytes::copy_from_slice(&src[key_start..key_start + key_len]);
        let payload = src.split_to(total).freeze();
        Ok(Some(Request {
            payload,
            key,
            expects_reply: !QUIET_OPCODES.contains(&opcode),
        }))
    }

    fn frame_response(&self, src: &mut BytesMut) -> Result<Option<Bytes>, CitrineError> {
        let Some(total) = frame_len(src, MAGIC_RESPONSE)? else {
            return Ok(None);
        };
        if src.len() < total {
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }

    fn encode_error(&self, msg: &str, dst: &mut BytesMut) {
        let body = msg.as_bytes();
        dst.put_u8(MAGIC_RESPONSE);
        dst.put_u8(0x00); // opcode
        dst.put_u16(0); // key length
        dst.put_u8(0); // extras length
        dst.put_u8(0); // data type
        dst.put_u16(STATUS_INTERNAL_ERROR);
        dst.put_u32(body.len() as u32);
        dst.put_u32(0); // opaque
        dst.put_u64(0); // cas
        dst.extend_from_slice(body);
    }
}
