//! Wire framing for the length-prefixed protocol.
//!
//! A frame is `opcode:i16 (LE) || body_len:i32 (LE) || body:bytes[body_len]`.
//! The header is exactly [`HEADER_SIZE`] bytes. There is no magic number, no
//! version field, and no checksum — compatibility between peers is
//! positional only.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size in bytes of the fixed frame header.
pub const HEADER_SIZE: usize = 6;

/// Default cap on `body_len`, in bytes (16 MiB). Connections that declare a
/// larger body in their header are closed before the body is read.
pub const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

/// Errors produced while validating a parsed frame header.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum FrameError {
    /// `body_len` exceeded the configured cap.
    #[error("frame body length {len} exceeds cap {cap}")]
    BodyTooLarge { len: u32, cap: u32 },
}

/// Parse the fixed 6-byte header into `(opcode, body_len)`.
///
/// `body_len` is carried on the wire as a signed little-endian `i32`, but a
/// conforming sender never encodes a negative value. Negative values that
/// do arrive are clamped to zero by [`check_body_len`] rather than treated
/// as a protocol violation, since the encoding makes a negative length
/// unrepresentable in practice.
pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> (i16, i32) {
    let mut cursor: &[u8] = &buf[..];
    let opcode = cursor.get_i16_le();
    let body_len = cursor.get_i32_le();
    (opcode, body_len)
}

/// Encode `(opcode, body_len)` into a 6-byte header.
///
/// Kept for symmetry with [`parse_header`] even though the server never
/// sends frames itself (the send path is out of scope) — tests, and any
/// future sender, need a matching encoder.
pub fn encode_header(opcode: i16, body_len: i32) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    let mut cursor: &mut [u8] = &mut out[..];
    cursor.put_i16_le(opcode);
    cursor.put_i32_le(body_len);
    out
}

/// Validate a parsed body length against the configured cap, returning the
/// length as a `u32` on success.
pub fn check_body_len(body_len: i32, cap: u32) -> Result<u32, FrameError> {
    let len = body_len.max(0) as u32;
    if len > cap {
        Err(FrameError::BodyTooLarge { len, cap })
    } else {
        Ok(len)
    }
}
