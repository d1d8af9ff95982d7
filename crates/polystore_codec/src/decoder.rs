//! Canonical CBOR decoder.

use std::cmp::Ordering;

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Upper bound on array/map element counts accepted from input.
const MAX_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Upper bound on byte/text string lengths accepted from input.
const MAX_STRING_LEN: u64 = 256 * 1024 * 1024;

/// Decodes exactly one canonical value from `bytes`.
///
/// # Errors
///
/// Returns an error if the input is malformed, non-canonical, contains
/// floats, tags or indefinite-length items, or has trailing bytes.
pub fn decode_canonical(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode_next()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            count: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A strict canonical CBOR decoder over a byte slice.
#[derive(Debug)]
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CanonicalDecoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns true once all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the unconsumed input.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decodes the next value.
    ///
    /// # Errors
    ///
    /// See [`decode_canonical`].
    pub fn decode_next(&mut self) -> CodecResult<Value> {
        let initial = self.read_byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.read_argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                let n = self.read_argument(info)?;
                let n = i64::try_from(n).map_err(|_| CodecError::IntegerOverflow)?;
                Ok(Value::Integer(-1 - n))
            }
            2 => {
                let len = self.read_length(info, MAX_STRING_LEN)?;
                Ok(Value::Bytes(self.read_slice(len)?.to_vec()))
            }
            3 => {
                let len = self.read_length(info, MAX_STRING_LEN)?;
                let raw = self.read_slice(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => {
                let len = self.read_length(info, MAX_ELEMENTS)?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.decode_next()?);
                }
                Ok(Value::Array(items))
            }
            5 => self.decode_map(info),
            6 => Err(CodecError::invalid_structure("tagged values are not supported")),
            _ => self.decode_simple(info),
        }
    }

    fn decode_map(&mut self, info: u8) -> CodecResult<Value> {
        let data = self.data;
        let len = self.read_length(info, MAX_ELEMENTS)?;
        let mut pairs = Vec::with_capacity(len.min(1024));
        let mut previous_key: Option<&'a [u8]> = None;

        for _ in 0..len {
            let key_start = self.pos;
            let key = self.decode_next()?;
            let key_bytes = &data[key_start..self.pos];

            if let Some(prev) = previous_key {
                let ord = prev.len().cmp(&key_bytes.len()).then_with(|| prev.cmp(key_bytes));
                if ord != Ordering::Less {
                    return Err(CodecError::non_canonical(
                        "map keys must be unique and in canonical order",
                    ));
                }
            }
            previous_key = Some(key_bytes);

            let value = self.decode_next()?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }

    fn decode_simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            25..=27 => Err(CodecError::FloatForbidden),
            31 => Err(CodecError::IndefiniteLengthForbidden),
            other => Err(CodecError::invalid_structure(format!(
                "unsupported simple value {other}"
            ))),
        }
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_length(&mut self, info: u8, limit: u64) -> CodecResult<usize> {
        let len = self.read_argument(info)?;
        if len > limit {
            return Err(CodecError::LengthLimitExceeded {
                claimed: len,
                limit,
            });
        }
        usize::try_from(len).map_err(|_| CodecError::LengthLimitExceeded {
            claimed: len,
            limit,
        })
    }

    fn read_argument(&mut self, info: u8) -> CodecResult<u64> {
        let (value, minimum) = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => (u64::from(self.read_byte()?), 24),
            25 => {
                let b = self.read_slice(2)?;
                (u64::from(u16::from_be_bytes([b[0], b[1]])), 0x100)
            }
            26 => {
                let b = self.read_slice(4)?;
                (
                    u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                    0x1_0000,
                )
            }
            27 => {
                let b = self.read_slice(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                (u64::from_be_bytes(buf), 0x1_0000_0000)
            }
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::invalid_structure("reserved additional info")),
        };
        if value < minimum {
            return Err(CodecError::non_canonical(
                "argument could be encoded in fewer bytes",
            ));
        }
        Ok(value)
    }
}
