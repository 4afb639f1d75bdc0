//! Streaming RESP parser.
//!
//! [`parse`] consumes one value from the front of a buffer and returns
//! `(value, bytes_consumed)`, or `Err(Incomplete)` when the buffer holds
//! only part of a frame — callers read more data and retry.
//!
//! Buffers are `Bytes`, so bulk strings come out as zero-copy slices.

use bytes::Bytes;
use memchr::memchr;

use crate::error::{Error, Result};
use crate::resp::types::RespValue;

/// Parse one RESP value from the front of `buf`.
pub fn parse(buf: &Bytes) -> Result<(RespValue, usize)> {
    parse_at(buf, 0)
}

/// Convenience wrapper for tests and one-shot callers: parse from a slice.
pub fn parse_slice(buf: &[u8]) -> Result<(RespValue, usize)> {
    parse(&Bytes::copy_from_slice(buf))
}

fn parse_at(buf: &Bytes, pos: usize) -> Result<(RespValue, usize)> {
    let type_byte = *buf.get(pos).ok_or(Error::Incomplete)?;
    match type_byte {
        b'+' => {
            let (line, next) = read_line(buf, pos + 1)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| Error::Protocol("non-UTF-8 simple string".into()))?;
            Ok((RespValue::SimpleString(s.to_string()), next))
        }
        b'-' => {
            let (line, next) = read_line(buf, pos + 1)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| Error::Protocol("non-UTF-8 error reply".into()))?;
            Ok((RespValue::Error(s.to_string()), next))
        }
        b':' => {
            let (line, next) = read_line(buf, pos + 1)?;
            Ok((RespValue::Integer(parse_int(line)?), next))
        }
        b'$' => {
            let (line, next) = read_line(buf, pos + 1)?;
            let len = parse_int(line)?;
            if len < 0 {
                return Ok((RespValue::Null, next));
            }
            let len = len as usize;
            let end = next + len + 2;
            if buf.len() < end {
                return Err(Error::Incomplete);
            }
            if &buf[end - 2..end] != b"\r\n" {
                return Err(Error::Protocol("bulk string missing CRLF terminator".into()));
            }
            Ok((RespValue::BulkString(buf.slice(next..next + len)), end))
        }
        b'*' => {
            let (line, mut next) = read_line(buf, pos + 1)?;
            let count = parse_int(line)?;
            if count < 0 {
                return Ok((RespValue::Null, next));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (item, after) = parse_at(buf, next)?;
                items.push(item);
                next = after;
            }
            Ok((RespValue::Array(items), next))
        }
        other => Err(Error::Protocol(format!("unknown RESP type byte: 0x{other:02x}"))),
    }
}

/// Read the line starting at `start` up to CRLF. Returns the line body and
/// the position just past the CRLF.
fn read_line(buf: &Bytes, start: usize) -> Result<(&[u8], usize)> {
    if start >= buf.len() {
        return Err(Error::Incomplete);
    }
    match memchr(b'\r', &buf[start..]) {
        Some(offset) => {
            let cr = start + offset;
            if cr + 1 >= buf.len() {
                return Err(Error::Incomplete);
            }
            if buf[cr + 1] != b'\n' {
                return Err(Error::Protocol("bare CR inside RESP line".into()));
            }
            Ok((&buf[start..cr], cr + 2))
        }
        None => Err(Error::Incomplete),
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("non-UTF-8 integer".into()))?;
    s.parse::<i64>()
        .map_err(|_| Error::Protocol(format!("invalid RESP integer: {s:?}")))
}
