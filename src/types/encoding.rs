//! Binary encoding and decoding traits for script resources.
//!
//! All encoded data is little-endian and fixed-width so a compiled script
//! produces the same bytes on every host.
//!
//! # Binary Format
//!
//! - Integers and `f32`: little-endian, fixed-width
//! - `usize`: encoded as `u64`
//! - `Vec<T>`/`String`: `u64` length prefix followed by elements
//! - Arrays `[T; N]`: elements back to back, no prefix

use kvm_derive::Error;

/// Destination for encoded bytes.
pub trait EncodeSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Counts encoded bytes without storing them.
#[derive(Debug, Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Types with a canonical binary representation.
pub trait Encode {
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Number of bytes [`Encode::encode`] writes.
    fn encoded_len(&self) -> usize {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);
        counter.len()
    }

    /// Serializes into a buffer sized exactly for the value.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }
}

/// Errors produced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid value")]
    InvalidValue,
    #[error("length prefix exceeds limit")]
    LengthOverflow,
}

/// Types that can be read back from their [`Encode`] representation.
pub trait Decode: Sized {
    /// Reads one value and advances `input` past it.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value that must span the whole of `data`.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::InvalidValue);
        }
        Ok(value)
    }
}

/// Upper bound on decoded collection lengths.
pub const MAX_VEC_LEN: usize = 1 << 24;

fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], DecodeError> {
    let (head, rest) = input
        .split_first_chunk::<N>()
        .ok_or(DecodeError::UnexpectedEof)?;
    *input = rest;
    Ok(*head)
}

impl Encode for u8 {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self]);
    }
}

impl Decode for u8 {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let [byte] = read_array::<1>(input)?;
        Ok(byte)
    }
}

macro_rules! impl_fixed_width {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    Ok(<$t>::from_le_bytes(read_array(input)?))
                }
            }
        )*
    };
}

impl_fixed_width!(u32, u64, f32);

impl Encode for usize {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (*self as u64).encode(out);
    }
}

impl Decode for usize {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        usize::try_from(u64::decode(input)?).map_err(|_| DecodeError::LengthOverflow)
    }
}

fn decode_len(input: &mut &[u8]) -> Result<usize, DecodeError> {
    let len = usize::decode(input)?;
    if len > MAX_VEC_LEN {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(len)
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(input)?;
        // Each element is at least one byte, so a prefix larger than the input is bogus.
        let mut items = Vec::with_capacity(len.min(input.len()));
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl Encode for String {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_str().encode(out);
    }
}

impl Encode for str {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(input)?;
        if input.len() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let (bytes, rest) = input.split_at(len);
        *input = rest;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidValue)
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut items = Vec::with_capacity(N);
        for _ in 0..N {
            items.push(T::decode(input)?);
        }
        items.try_into().map_err(|_| DecodeError::InvalidValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counter_matches_to_bytes() {
        let value = vec![1u32, 2, 3];
        assert_eq!(value.encoded_len(), 8 + 3 * 4);
        assert_eq!(value.to_bytes().len(), value.encoded_len());
    }

    #[test]
    fn u32_is_little_endian() {
        assert_eq!(0x0403_0201u32.to_bytes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn f32_keeps_bit_pattern() {
        let bytes = 1.5f32.to_bytes();
        assert_eq!(bytes, 1.5f32.to_bits().to_le_bytes().to_vec());
        assert_eq!(f32::from_bytes(&bytes).unwrap(), 1.5);
    }

    #[test]
    fn usize_is_encoded_as_u64() {
        assert_eq!(7usize.to_bytes(), 7u64.to_bytes());
    }

    #[test]
    fn vec_has_length_prefix() {
        let bytes = vec![9u8, 8].to_bytes();
        assert_eq!(&bytes[..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..], &[9, 8]);
    }

    #[test]
    fn vec_length_limit() {
        let bytes = ((MAX_VEC_LEN + 1) as u64).to_bytes();
        assert_eq!(
            Vec::<u8>::from_bytes(&bytes),
            Err(DecodeError::LengthOverflow)
        );
    }

    #[test]
    fn vec_prefix_longer_than_input() {
        let mut bytes = 4u64.to_bytes();
        bytes.push(1);
        assert_eq!(Vec::<u8>::from_bytes(&bytes), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn string_roundtrip_and_invalid_utf8() {
        let bytes = String::from("update").to_bytes();
        assert_eq!(String::from_bytes(&bytes).unwrap(), "update");

        let mut bad = 1u64.to_bytes();
        bad.push(0xFF);
        assert_eq!(String::from_bytes(&bad), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn array_has_no_prefix() {
        let magic = *b"_scr";
        assert_eq!(magic.to_bytes(), b"_scr".to_vec());
        assert_eq!(<[u8; 4]>::from_bytes(b"_scr").unwrap(), magic);
    }

    #[test]
    fn truncated_input() {
        assert_eq!(u64::from_bytes(&[1, 2, 3]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert_eq!(u8::from_bytes(&[1, 2]), Err(DecodeError::InvalidValue));
    }
}
