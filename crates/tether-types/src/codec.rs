//! Binary codec shared by every value that crosses the wire.
//!
//! Values implement [`Write`] to append themselves to a `BufMut` and [`Read`]
//! to parse themselves from a `Buf`. Primitive helpers cover the handful of
//! shapes the protocol uses: big-endian fixed integers, LEB128 varints,
//! length-prefixed blobs and UTF-8 strings, booleans and enum ordinals.
//!
//! Every reader checks the remaining length before consuming, so a short or
//! malformed buffer fails with a [`CodecError`] instead of panicking or
//! yielding a default.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use thiserror::Error;

/// Largest blob or string accepted by [`get_blob`].
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

/// Maximum encoded size of a `u64` varint.
const MAX_VARINT_LEN: usize = 10;

/// Errors raised while decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid bool: {0}")]
    InvalidBool(u8),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("invalid {kind} ordinal: {value}")]
    InvalidOrdinal { kind: &'static str, value: u8 },
    #[error("length exceeded: {0} > {1}")]
    LengthExceeded(usize, usize),
    #[error("invalid data in {0}: {1}")]
    InvalidData(&'static str, String),
}

impl From<CodecError> for std::io::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::EndOfBuffer => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Types that can append their canonical encoding to a buffer.
pub trait Write {
    /// Appends this value to `buf`.
    fn write(&self, buf: &mut impl BufMut);

    /// Encodes this value into a fresh buffer.
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

/// Types that can be parsed from their canonical encoding.
pub trait Read: Sized {
    /// Reads one value, consuming exactly its encoded bytes.
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError>;

    /// Decodes a value that must occupy the whole buffer.
    fn decode(mut buf: impl Buf) -> Result<Self, CodecError> {
        let value = Self::read(&mut buf)?;
        if buf.has_remaining() {
            return Err(CodecError::ExtraData(buf.remaining()));
        }
        Ok(value)
    }
}

fn ensure(buf: &impl Buf, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::EndOfBuffer);
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidBool(other)),
    }
}

/// Reads exactly `N` raw bytes.
pub fn get_array<const N: usize>(buf: &mut impl Buf) -> Result<[u8; N], CodecError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Writes `value` as an unsigned LEB128 varint.
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Reads an unsigned LEB128 varint, rejecting overlong or overflowing input.
pub fn get_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut result = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = get_u8(buf)?;
        let bits = (byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(CodecError::InvalidVarint);
        }
        result |= bits << (7 * i);
        if byte & 0x80 == 0 {
            // A trailing zero group means the value had a shorter encoding.
            if i > 0 && bits == 0 {
                return Err(CodecError::InvalidVarint);
            }
            return Ok(result);
        }
    }
    Err(CodecError::InvalidVarint)
}

fn get_len(buf: &mut impl Buf, max: usize) -> Result<usize, CodecError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| CodecError::LengthExceeded(usize::MAX, max))?;
    if len > max {
        return Err(CodecError::LengthExceeded(len, max));
    }
    Ok(len)
}

/// Writes a varint length followed by the raw bytes.
pub fn put_blob(buf: &mut impl BufMut, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Reads a varint-length-prefixed byte blob.
pub fn get_blob(buf: &mut impl Buf) -> Result<Bytes, CodecError> {
    let len = get_len(buf, MAX_BLOB_LEN)?;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_str(buf: &mut impl BufMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

pub fn get_str(buf: &mut impl Buf) -> Result<String, CodecError> {
    let bytes = get_blob(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Writes a count-prefixed sequence of values.
pub fn put_set<'a, T, I>(buf: &mut impl BufMut, items: I)
where
    T: Write + 'a,
    I: ExactSizeIterator<Item = &'a T>,
{
    put_varint(buf, items.len() as u64);
    for item in items {
        item.write(buf);
    }
}

/// Reads a count-prefixed sequence into an ordered set.
///
/// Every element occupies at least one byte, so a count larger than the
/// remaining input is rejected before anything is allocated.
pub fn get_set<T: Read + Ord>(buf: &mut impl Buf) -> Result<BTreeSet<T>, CodecError> {
    let max = buf.remaining();
    let count = get_len(buf, max)?;
    let mut out = BTreeSet::new();
    for _ in 0..count {
        out.insert(T::read(buf)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(127), vec![0x7f]);
        assert_eq!(varint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(300), vec![0xac, 0x02]);
        assert_eq!(varint_bytes(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_varint_max_value_reads_back() {
        let bytes = varint_bytes(u64::MAX);
        assert_eq!(get_varint(&mut &bytes[..]).unwrap(), u64::MAX);
    }

    #[test]
    fn test_varint_rejects_overlong() {
        // 0 encoded in two bytes.
        let bytes = [0x80u8, 0x00];
        assert_eq!(get_varint(&mut &bytes[..]), Err(CodecError::InvalidVarint));
    }

    #[test]
    fn test_varint_rejects_overflow() {
        let bytes = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        assert_eq!(get_varint(&mut &bytes[..]), Err(CodecError::InvalidVarint));
    }

    #[test]
    fn test_varint_truncated() {
        let bytes = [0x80u8];
        assert_eq!(get_varint(&mut &bytes[..]), Err(CodecError::EndOfBuffer));
    }

    #[test]
    fn test_blob_truncated_payload() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 10);
        buf.put_slice(b"short");
        assert_eq!(get_blob(&mut buf.freeze()), Err(CodecError::EndOfBuffer));
    }

    #[test]
    fn test_str_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, &[0xff, 0xfe]);
        assert_eq!(get_str(&mut buf.freeze()), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_bool_rejects_other_values() {
        let bytes = [2u8];
        assert_eq!(get_bool(&mut &bytes[..]), Err(CodecError::InvalidBool(2)));
    }

    #[test]
    fn test_fixed_ints_need_full_width() {
        let bytes = [0u8; 7];
        assert_eq!(get_i64(&mut &bytes[..]), Err(CodecError::EndOfBuffer));
        assert_eq!(get_i32(&mut &bytes[..3]), Err(CodecError::EndOfBuffer));
    }

    #[test]
    fn test_codec_error_maps_to_io_kind() {
        let eof: std::io::Error = CodecError::EndOfBuffer.into();
        assert_eq!(eof.kind(), std::io::ErrorKind::UnexpectedEof);
        let bad: std::io::Error = CodecError::InvalidUtf8.into();
        assert_eq!(bad.kind(), std::io::ErrorKind::InvalidData);
    }
}
