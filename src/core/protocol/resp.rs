// src/core/protocol/resp.rs

//! Framing for RESP (REdis Serialization Protocol), RESP2 grammar.
//!
//! The proxy never materializes frames; it only scans for frame boundaries
//! and, on the request side, lifts out the routing key.

use super::{ProxyCodec, Request};
use crate::core::CitrineError;
use bytes::{Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits to reject malformed or abusive frames early.
const MAX_LINE: usize = 64 * 1024;
const MAX_ARRAY_ELEMENTS: i64 = 1024 * 1024;
const MAX_BULK_SIZE: i64 = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 16;

pub struct RespCodec;

/// Returns the index just past the first CRLF at or after `from`.
fn find_line_end(buf: &[u8], from: usize) -> Result<Option<usize>, CitrineError> {
    let window = &buf[from..];
    match window.windows(CRLF_LEN).position(|w| w == CRLF) {
        Some(pos) => Ok(Some(from + pos + CRLF_LEN)),
        None => {
            if window.len() > MAX_LINE {
                return Err(CitrineError::Protocol(
                    "RESP line exceeds maximum length".to_string(),
                ));
            }
            Ok(None)
        }
    }
}

fn parse_int(buf: &[u8]) -> Result<i64, CitrineError> {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CitrineError::Protocol("invalid RESP length prefix".to_string()))
}

/// Scans one complete frame starting at `pos`; returns the index just past
/// it, or `None` if the buffer is still incomplete.
fn scan_frame(buf: &[u8], pos: usize, depth: usize) -> Result<Option<usize>, CitrineError> {
    if depth > MAX_DEPTH {
        return Err(CitrineError::Protocol("RESP nesting too deep".to_string()));
    }
    if pos >= buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_line_end(buf, pos + 1)? else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end - CRLF_LEN];
    match buf[pos] {
        b'+' | b'-' | b':' => Ok(Some(line_end)),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some(line_end));
            }
            if !(0..=MAX_BULK_SIZE).contains(&len) {
                return Err(CitrineError::Protocol(
                    "RESP bulk string length out of range".to_string(),
                ));
            }
            let end = line_end + len as usize + CRLF_LEN;
            if buf.len() < end {
                return Ok(None);
            }
            Ok(Some(end))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some(line_end));
            }
            if !(0..=MAX_ARRAY_ELEMENTS).contains(&len) {
                return Err(CitrineError::Protocol(
                    "RESP array length out of range".to_string(),
                ));
            }
            let mut cursor = line_end;
            for _ in 0..len {
                match scan_frame(buf, cursor, depth + 1)? {
                    Some(next) => cursor = next,
                    None => return Ok(None),
                }
            }
            Ok(Some(cursor))
        }
        other => Err(CitrineError::Protocol(format!(
            "unknown RESP type byte 0x{other:02x}"
        ))),
    }
}

/// Reads the payload span of the bulk string starting at `pos`, which the
/// caller has already verified is complete.
fn bulk_payload(buf: &[u8], pos: usize) -> Result<(usize, usize), CitrineError> {
    if buf[pos] != b'$' {
        return Err(CitrineError::Protocol(
            "RESP command arguments must be bulk strings".to_string(),
        ));
    }
    let line_end = find_line_end(buf, pos + 1)?
        .ok_or_else(|| CitrineError::Internal("bulk string vanished mid-scan".to_string()))?;
    let len = parse_int(&buf[pos + 1..line_end - CRLF_LEN])?;
    if len < 0 {
        return Err(CitrineError::Protocol(
            "null bulk string in RESP command".to_string(),
        ));
    }
    Ok((line_end, line_end + len as usize))
}

impl ProxyCodec for RespCodec {
    fn frame_request(&self, src: &mut BytesMut) -> Result<Option<Request>, CitrineError> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != b'*' {
            return Err(CitrineError::Protocol(
                "inline RESP commands are not supported".to_string(),
            ));
        }
        let Some(total) = scan_frame(src, 0, 0)? else {
            return Ok(None);
        };

        let header_end = find_line_end(src, 1)?
            .ok_or_else(|| CitrineError::Internal("array header vanished mid-scan".to_string()))?;
        let elements = parse_int(&src[1..header_end - CRLF_LEN])?;
        if elements < 1 {
            return Err(CitrineError::Protocol("empty RESP command".to_string()));
        }

        // Route by the first argument when present (GET key, SET key v, ...);
        // keyless commands (PING, ...) hash on the command name itself.
        let (first_start, first_end) = bulk_payload(src, header_end)?;
        let key = if elements >= 2 {
            let after_first = first_end + CRLF_LEN;
            let (arg_start, arg_end) = bulk_payload(src, after_first)?;
            Bytes::copy_from_slice(&src[arg_start..arg_end])
        } else {
            Bytes::copy_from_slice(&src[first_start..first_end])
        };

        let payload = src.split_to(total).freeze();
        Ok(Some(Request {
            payload,
            key,
            expects_reply: true,
        }))
    }

    fn frame_response(&self, src: &mut BytesMut) -> Result<Option<Bytes>, CitrineError> {
        match scan_frame(src, 0, 0)? {
            Some(total) => Ok(Some(src.split_to(total).freeze())),
            None => Ok(None),
        }
    }

    fn encode_error(&self, msg: &str, dst: &mut BytesMut) {
        dst.extend_from_slice(b"-ERR ");
        dst.extend_from_slice(msg.as_bytes());
        dst.extend_from_slice(CRLF);
    }
}

/// Encodes an `AUTH <password>` command, sent once on each fresh backend
/// connection when the cluster has `redis_auth` configured.
pub fn encode_auth_command(password: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"*2\r\n$4\r\nAUTH\r\n$");
    buf.extend_from_slice(password.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(password.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.freeze()
}
