//! Consensus wire encoding
//!
//! Little-endian integers, CompactSize lengths and length-prefixed byte
//! strings as used by every P2P message and by block headers/transactions.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Upper bound on any length prefix we are willing to allocate for
pub const MAX_VEC_SIZE: u64 = 4_000_000;

/// Wire decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Unexpected end of data (needed {needed} more bytes)")]
    UnexpectedEof { needed: usize },
    #[error("Non-canonical CompactSize encoding")]
    NonCanonicalVarInt,
    #[error("Length prefix {requested} exceeds maximum {max}")]
    OversizedVec { requested: u64, max: u64 },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("Parse failed: {0}")]
    ParseFailed(&'static str),
}

/// Types with a consensus serialization
pub trait Encodable {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B);
}

/// Types that can be read back from their consensus serialization
pub trait Decodable: Sized {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError>;
}

/// Serialize a value into a fresh byte vector
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.consensus_encode(&mut out);
    out
}

/// Deserialize a value, requiring the whole input to be consumed
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, EncodeError> {
    let mut buf = data;
    let value = T::consensus_decode(&mut buf)?;
    if buf.has_remaining() {
        return Err(EncodeError::TrailingBytes(buf.remaining()));
    }
    Ok(value)
}

/// Fail unless at least `n` bytes remain
pub fn ensure<B: Buf>(buf: &B, n: usize) -> Result<(), EncodeError> {
    if buf.remaining() < n {
        return Err(EncodeError::UnexpectedEof {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! impl_int_encodable {
    ($ty:ty, $size:expr, $get:ident, $put:ident) => {
        impl Encodable for $ty {
            fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }
        }

        impl Decodable for $ty {
            fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
                ensure(buf, $size)?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int_encodable!(u8, 1, get_u8, put_u8);
impl_int_encodable!(u16, 2, get_u16_le, put_u16_le);
impl_int_encodable!(u32, 4, get_u32_le, put_u32_le);
impl_int_encodable!(i32, 4, get_i32_le, put_i32_le);
impl_int_encodable!(u64, 8, get_u64_le, put_u64_le);
impl_int_encodable!(i64, 8, get_i64_le, put_i64_le);

impl Encodable for bool {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(u8::from(*self));
    }
}

impl Decodable for bool {
    fn consensus_decode<B: Buf>(buf: &mut B) -> Result<Self, EncodeError> {
        Ok(u8::consensus_decode(buf)? != 0)
    }
}

/// Write a CompactSize length
pub fn write_compact_size<B: BufMut>(buf: &mut B, n: u64) {
    match n {
        0..=0xFC => buf.put_u8(n as u8),
        0xFD..=0xFFFF => {
            buf.put_u8(0xFD);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.put_u8(0xFE);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xFF);
            buf.put_u64_le(n);
        }
    }
}

/// Read a CompactSize length, rejecting non-minimal encodings
pub fn read_compact_size<B: Buf>(buf: &mut B) -> Result<u64, EncodeError> {
    let prefix = u8::consensus_decode(buf)?;
    let (value, min) = match prefix {
        0xFF => (u64::consensus_decode(buf)?, 0x1_0000_0000),
        0xFE => (u32::consensus_decode(buf)? as u64, 0x1_0000),
        0xFD => (u16::consensus_decode(buf)? as u64, 0xFD),
        n => return Ok(n as u64),
    };
    if value < min {
        return Err(EncodeError::NonCanonicalVarInt);
    }
    Ok(value)
}

/// Read a length prefix and check it against `max`
pub fn read_length<B: Buf>(buf: &mut B, max: u64) -> Result<usize, EncodeError> {
    let len = read_compact_size(buf)?;
    if len > max {
        return Err(EncodeError::OversizedVec {
            requested: len,
            max,
        });
    }
    Ok(len as usize)
}

/// Write a length-prefixed byte string
pub fn write_var_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    write_compact_size(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read a length-prefixed byte string
pub fn read_var_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, EncodeError> {
    let len = read_length(buf, MAX_VEC_SIZE)?;
    ensure(buf, len)?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

/// Read a length-prefixed string, replacing invalid UTF-8
pub fn read_var_str<B: Buf>(buf: &mut B) -> Result<String, EncodeError> {
    let data = read_var_bytes(buf)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Write a CompactSize-counted list
pub fn write_list<B: BufMut, T: Encodable>(buf: &mut B, items: &[T]) {
    write_compact_size(buf, items.len() as u64);
    for item in items {
        item.consensus_encode(buf);
    }
}

/// Read a CompactSize-counted list of at most `max` elements
pub fn read_list<B: Buf, T: Decodable>(buf: &mut B, max: u64) -> Result<Vec<T>, EncodeError> {
    let len = read_length(buf, max)?;
    // The prefix is attacker-controlled; grow as elements actually decode.
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(T::consensus_decode(buf)?);
    }
    Ok(items)
}

/// Read exactly `N` bytes
pub fn read_array<B: Buf, const N: usize>(buf: &mut B) -> Result<[u8; N], EncodeError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
