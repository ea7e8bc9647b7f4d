//! Byte-level serialization for wire messages and save states.
//!
//! Everything that crosses the network or the save state ring is encoded
//! through the [`Serde`] trait: little-endian integers, length-prefixed
//! variable data, no padding and no platform-dependent layout. Decoding is
//! strict about bounds (truncated buffers are an error) but tolerant of
//! trailing bytes, so message formats can be extended.

use std::fmt;

/// The fixed-layout serialization contract.
///
/// # Contract
///
/// * `serialize` followed by `deserialize` reproduces an equal value.
/// * `serde_size` returns exactly the number of bytes `serialize` appends.
/// * For types used as session inputs, `serde_size` must be the same for
///   every value, including [`Default::default()`]. The input pipeline
///   relies on this to size its buffers before any real input exists.
pub trait Serde: Sized {
    /// Number of bytes [`Serde::serialize`] will append for this value.
    fn serde_size(&self) -> usize;

    /// Appends the encoded value to `out`.
    fn serialize(&self, out: &mut Vec<u8>);

    /// Decodes a value from the reader, advancing its position.
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError>;
}

/// An error encountered while decoding bytes into a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the value was fully decoded.
    UnexpectedEof {
        /// Bytes the decoder tried to read.
        needed: usize,
        /// Bytes actually remaining.
        remaining: usize,
    },
    /// A length field exceeded its protocol cap.
    CapExceeded {
        /// Name of the capped quantity.
        what: &'static str,
        /// Claimed length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
    /// A discriminant did not match any known message kind.
    UnknownKind(i32),
    /// A length field was negative or otherwise unrepresentable.
    InvalidLength(i64),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof { needed, remaining } => write!(
                f,
                "unexpected end of buffer: needed {needed} bytes, {remaining} remaining"
            ),
            DecodeError::CapExceeded { what, len, max } => {
                write!(f, "{what} length {len} exceeds maximum of {max}")
            }
            DecodeError::UnknownKind(kind) => write!(f, "unknown message kind {kind}"),
            DecodeError::InvalidLength(len) => write!(f, "invalid length field {len}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A bounds-checked cursor over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes and returns the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Consumes a single byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Consumes a single byte as a boolean. Any nonzero value is `true`.
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    /// Consumes a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Consumes a little-endian `i16`.
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Consumes a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Consumes a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Consumes a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    /// Consumes a non-negative `i32` length prefix, checked against `max`.
    pub fn read_length(&mut self, what: &'static str, max: usize) -> Result<usize, DecodeError> {
        let raw = self.read_i32()?;
        if raw < 0 {
            return Err(DecodeError::InvalidLength(i64::from(raw)));
        }
        let len = raw as usize;
        if len > max {
            return Err(DecodeError::CapExceeded { what, len, max });
        }
        Ok(len)
    }
}

/// Encodes a value into a fresh byte vector.
#[must_use]
pub fn encode<T: Serde>(value: &T) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.serde_size());
    value.serialize(&mut out);
    out
}

/// Decodes a value from the start of `buf`. Trailing bytes are ignored.
pub fn decode<T: Serde>(buf: &[u8]) -> Result<T, DecodeError> {
    let mut reader = ByteReader::new(buf);
    T::deserialize(&mut reader)
}

macro_rules! impl_serde_int {
    ($ty:ty, $size:expr, $read:ident) => {
        impl Serde for $ty {
            fn serde_size(&self) -> usize {
                $size
            }

            fn serialize(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
                r.$read()
            }
        }
    };
}

impl_serde_int!(u16, 2, read_u16);
impl_serde_int!(i16, 2, read_i16);
impl_serde_int!(u32, 4, read_u32);
impl_serde_int!(i32, 4, read_i32);
impl_serde_int!(u64, 8, read_u64);

impl Serde for u8 {
    fn serde_size(&self) -> usize {
        1
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        r.read_u8()
    }
}

impl Serde for bool {
    fn serde_size(&self) -> usize {
        1
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        r.read_bool()
    }
}

impl Serde for crate::Frame {
    fn serde_size(&self) -> usize {
        4
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        self.as_i32().serialize(out);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(crate::Frame::new(r.read_i32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use proptest::prelude::*;

    #[test]
    fn primitives_round_trip() {
        let mut out = Vec::new();
        0xABu8.serialize(&mut out);
        true.serialize(&mut out);
        0x1234u16.serialize(&mut out);
        (-7i16).serialize(&mut out);
        0xDEADBEEFu32.serialize(&mut out);
        (-1i32).serialize(&mut out);
        u64::MAX.serialize(&mut out);

        let mut r = ByteReader::new(&out);
        assert_eq!(u8::deserialize(&mut r).unwrap(), 0xAB);
        assert!(bool::deserialize(&mut r).unwrap());
        assert_eq!(u16::deserialize(&mut r).unwrap(), 0x1234);
        assert_eq!(i16::deserialize(&mut r).unwrap(), -7);
        assert_eq!(u32::deserialize(&mut r).unwrap(), 0xDEADBEEF);
        assert_eq!(i32::deserialize(&mut r).unwrap(), -1);
        assert_eq!(u64::deserialize(&mut r).unwrap(), u64::MAX);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(encode(&0x0102u16), vec![0x02, 0x01]);
        assert_eq!(encode(&0x01020304u32), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut r = ByteReader::new(&[0x01, 0x02]);
        assert!(matches!(
            u32::deserialize(&mut r),
            Err(DecodeError::UnexpectedEof { needed: 4, remaining: 2 })
        ));
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let mut buf = encode(&42u32);
        buf.extend_from_slice(&[0xFF; 8]);
        assert_eq!(decode::<u32>(&buf).unwrap(), 42);
    }

    #[test]
    fn null_frame_round_trips() {
        assert_eq!(decode::<Frame>(&encode(&Frame::NULL)).unwrap(), Frame::NULL);
    }

    #[test]
    fn negative_length_rejected() {
        let buf = encode(&(-5i32));
        let mut r = ByteReader::new(&buf);
        assert!(matches!(
            r.read_length("items", 100),
            Err(DecodeError::InvalidLength(-5))
        ));
    }

    #[test]
    fn length_cap_enforced() {
        let buf = encode(&400i32);
        let mut r = ByteReader::new(&buf);
        assert!(matches!(
            r.read_length("items", 16),
            Err(DecodeError::CapExceeded { len: 400, max: 16, .. })
        ));
    }

    proptest! {
        #[test]
        fn u64_round_trips(value: u64) {
            prop_assert_eq!(decode::<u64>(&encode(&value)).unwrap(), value);
        }

        #[test]
        fn frame_round_trips(raw: i32) {
            let frame = Frame::new(raw);
            prop_assert_eq!(decode::<Frame>(&encode(&frame)).unwrap(), frame);
        }
    }
}
