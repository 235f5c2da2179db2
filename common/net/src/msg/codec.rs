//! Primitive readers and writers shared by all messages.
//!
//! Readers never panic on short or hostile input: every access checks the
//! remaining length first and reports a [`DecodeError`] instead.

use bytes::{Buf, BufMut};
use std::fmt;

const VARINT_MAX_BYTES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Incomplete { needed: usize, remaining: usize },
    VarIntTooLong,
    UnknownTag(u8),
    UnknownStatus(i32),
    NegativeLength(i32),
    TooLong { len: usize, max: usize },
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete { needed, remaining } => write!(
                f,
                "message ended early, needed {} bytes but {} remain",
                needed, remaining
            ),
            Self::VarIntTooLong => write!(f, "VarInt longer than {} bytes", VARINT_MAX_BYTES),
            Self::UnknownTag(tag) => write!(f, "unknown message tag {}", tag),
            Self::UnknownStatus(status) => write!(f, "unknown request status {}", status),
            Self::NegativeLength(len) => write!(f, "negative length prefix {}", len),
            Self::TooLong { len, max } => write!(f, "length {} exceeds limit {}", len, max),
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub(crate) fn ensure(buf: &impl Buf, needed: usize) -> Result<(), DecodeError> {
    let remaining = buf.remaining();
    if remaining < needed {
        Err(DecodeError::Incomplete { needed, remaining })
    } else {
        Ok(())
    }
}

pub(crate) fn get_u8(buf: &mut impl Buf) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_i32(buf: &mut impl Buf) -> Result<i32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_i64(buf: &mut impl Buf) -> Result<i64, DecodeError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub(crate) fn get_bool(buf: &mut impl Buf) -> Result<bool, DecodeError> { Ok(get_u8(buf)? != 0) }

pub(crate) fn put_varint(buf: &mut impl BufMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

pub(crate) fn get_varint(buf: &mut impl Buf) -> Result<i32, DecodeError> {
    let mut value = 0u32;
    for i in 0..VARINT_MAX_BYTES {
        let byte = get_u8(buf)?;
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(DecodeError::VarIntTooLong)
}

/// Reads a list length prefix. Returns `(declared, kept)`: negative prefixes
/// count as zero and `kept` is capped at `max`. Callers must still consume
/// all `declared` elements so the frame stays aligned.
pub(crate) fn get_list_len(buf: &mut impl Buf, max: usize) -> Result<(usize, usize), DecodeError> {
    let declared = get_varint(buf)?.max(0) as usize;
    Ok((declared, declared.min(max)))
}

/// Reads `declared` big-endian `i64`s, keeping the first `kept`.
pub(crate) fn get_i64_list(
    buf: &mut impl Buf,
    declared: usize,
    kept: usize,
) -> Result<Vec<i64>, DecodeError> {
    ensure(buf, declared.saturating_mul(8))?;
    let mut out = Vec::with_capacity(kept);
    for i in 0..declared {
        let v = buf.get_i64();
        if i < kept {
            out.push(v);
        }
    }
    Ok(out)
}

fn get_len_prefix(buf: &mut impl Buf, max: usize) -> Result<usize, DecodeError> {
    let len = get_varint(buf)?;
    if len < 0 {
        return Err(DecodeError::NegativeLength(len));
    }
    let len = len as usize;
    if len > max {
        return Err(DecodeError::TooLong { len, max });
    }
    ensure(buf, len)?;
    Ok(len)
}

pub(crate) fn put_byte_array(buf: &mut impl BufMut, data: &[u8]) {
    put_varint(buf, data.len() as i32);
    buf.put_slice(data);
}

pub(crate) fn get_byte_array(buf: &mut impl Buf, max: usize) -> Result<Vec<u8>, DecodeError> {
    let len = get_len_prefix(buf, max)?;
    let mut data = vec![0; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

pub(crate) fn put_str(buf: &mut impl BufMut, s: &str) { put_byte_array(buf, s.as_bytes()) }

pub(crate) fn get_str(buf: &mut impl Buf, max: usize) -> Result<String, DecodeError> {
    String::from_utf8(get_byte_array(buf, max)?).map_err(|_| DecodeError::InvalidUtf8)
}

pub(crate) fn get_fixed(buf: &mut impl Buf, len: usize) -> Result<Box<[u8]>, DecodeError> {
    ensure(buf, len)?;
    let mut data = vec![0; len];
    buf.copy_to_slice(&mut data);
    Ok(data.into_boxed_slice())
}
