// src/core/protocol/memcache.rs

//! Framing for the memcached text protocol.

use super::{ProxyCodec, Request};
use crate::core::CitrineError;
use bytes::{Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits to reject malformed or abusive frames early.
const MAX_COMMAND_LINE: usize = 8 * 1024;
const MAX_DATA_SIZE: usize = 512 * 1024 * 1024;

/// Storage commands carry a data block of `<bytes>` length after the line.
const STORAGE_COMMANDS: &[&[u8]] = &[b"set", b"add", b"replace", b"append", b"prepend", b"cas"];

/// Single-line commands with the key as the second token.
const KEYED_LINE_COMMANDS: &[&[u8]] = &[b"get", b"gets", b"delete", b"incr", b"decr", b"touch"];

pub struct MemcacheTextCodec;

/// Returns the index just past the first CRLF at or after `from`, bounded by
/// `limit`.
fn find_line_end(buf: &[u8], from: usize, limit: usize) -> Result<Option<usize>, CitrineError> {
    let window = &buf[from..];
    match window.windows(CRLF_LEN).position(|w| w == CRLF) {
        Some(pos) => Ok(Some(from + pos + CRLF_LEN)),
        None => {
            if window.len() > limit {
                return Err(CitrineError::Protocol(
                    "memcache line exceeds maximum length".to_string(),
                ));
            }
            Ok(None)
        }
    }
}

impl ProxyCodec for MemcacheTextCodec {
    fn frame_request(&self, src: &mut BytesMut) -> Result<Option<Request>, CitrineError> {
        let Some(line_end) = find_line_end(src, 0, MAX_COMMAND_LINE)? else {
            return Ok(None);
        };
        let line = &src[..line_end - CRLF_LEN];
        let tokens: Vec<&[u8]> = line.split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            return Err(CitrineError::Protocol("empty memcache command".to_string()));
        }

        let command = tokens[0];
        let noreply = tokens.last() == Some(&&b"noreply"[..]);

        if STORAGE_COMMANDS.contains(&command) {
            if tokens.len() < 5 {
                return Err(CitrineError::Protocol(format!(
                    "malformed memcache storage command '{}'",
                    String::from_utf8_lossy(command)
                )));
            }
            let bytes_len: usize = std::str::from_utf8(tokens[4])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    CitrineError::Protocol("invalid memcache data length".to_string())
                })?;
            if bytes_len > MAX_DATA_SIZE {
                return Err(CitrineError::Protocol(
                    "memcache data block exceeds maximum size".to_string(),
                ));
            }
            let total = line_end + bytes_len + CRLF_LEN;
            if src.len() < total {
                return Ok(None);
            }
            let key = Bytes::copy_from_slice(tokens[1]);
            let payload = src.split_to(total).freeze();
            return Ok(Some(Request {
                payload,
                key,
                expects_reply: !noreply,
            }));
        }

        if KEYED_LINE_COMMANDS.contains(&command) {
            if tokens.len() < 2 {
                return Err(CitrineError::Protocol(format!(
                    "missing key in memcache command '{}'",
                    String::from_utf8_lossy(command)
                )));
            }
            let key = Bytes::copy_from_slice(tokens[1]);
            let payload = src.split_to(line_end).freeze();
            return Ok(Some(Request {
                payload,
                key,
                expects_reply: !noreply,
            }));
        }

        Err(CitrineError::Protocol(format!(
            "unsupported memcache command '{}'",
            String::from_utf8_lossy(command)
        )))
    }

    fn frame_response(&self, src: &mut BytesMut) -> Result<Option<Bytes>, CitrineError> {
        let Some(first_line_end) = find_line_end(src, 0, MAX_COMMAND_LINE)? else {
            return Ok(None);
        };

        // Retrievals answer with zero or more VALUE blocks terminated by END.
        // Everything else is a single line.
        if !src.starts_with(b"VALUE ") {
            return Ok(Some(src.split_to(first_line_end).freeze()));
        }

        let mut pos = 0;
        loop {
            let Some(line_end) = find_line_end(src, pos, MAX_COMMAND_LINE)? else {
                return Ok(None);
            };
            let line = &src[pos..line_end - CRLF_LEN];
            if line == b"END" {
                return Ok(Some(src.split_to(line_end).freeze()));
            }
            if !line.starts_with(b"VALUE ") {
                return Err(CitrineError::Protocol(
                    "unexpected line inside memcache retrieval response".to_string(),
                ));
            }
            let tokens: Vec<&[u8]> =
                line.split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();
            if tokens.len() < 4 {
                return Err(CitrineError::Protocol(
                    "malformed memcache VALUE line".to_string(),
                ));
            }
            let bytes_len: usize = std::str::from_utf8(tokens[3])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    CitrineError::Protocol("invalid memcache VALUE length".to_string())
                })?;
            if bytes_len > MAX_DATA_SIZE {
                return Err(CitrineError::Protocol(
                    "memcache value exceeds maximum size".to_string(),
                ));
            }
            let block_end = line_end + bytes_len + CRLF_LEN;
            if src.len() < block_end {
                return Ok(None);
            }
            pos = block_end;
        }
    }

    fn encode_error(&self, msg: &str, dst: &mut BytesMut) {
        dst.extend_from_slice(b"SERVER_ERROR ");
        dst.extend_from_slice(msg.as_bytes());
        dst.extend_from_slice(CRLF);
    }
}
