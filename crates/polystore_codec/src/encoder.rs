//! Canonical CBOR encoder.

use crate::value::Value;

/// Encodes a value to canonical CBOR bytes.
///
/// Output follows RFC 8949 §4.2.1 deterministic encoding:
/// - integers and lengths use the shortest form
/// - map entries are ordered by their encoded keys (length-first, then bytewise)
/// - no indefinite-length items
///
/// Encoding cannot fail because [`Value`] has no unrepresentable variants.
pub fn encode_canonical(value: &Value) -> Vec<u8> {
    let mut encoder = CanonicalEncoder::with_capacity(encoded_len(value));
    encoder.encode(value);
    encoder.into_bytes()
}

/// Returns the exact size of the canonical encoding of `value`.
///
/// Used to measure records without materializing the bytes.
pub fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Integer(n) => head_len(integer_argument(*n)),
        Value::Bytes(b) => head_len(b.len() as u64) + b.len(),
        Value::Text(s) => head_len(s.len() as u64) + s.len(),
        Value::Array(items) => {
            head_len(items.len() as u64) + items.iter().map(encoded_len).sum::<usize>()
        }
        Value::Map(pairs) => {
            head_len(pairs.len() as u64)
                + pairs
                    .iter()
                    .map(|(k, v)| encoded_len(k) + encoded_len(v))
                    .sum::<usize>()
        }
    }
}

#[allow(clippy::cast_sign_loss)]
fn integer_argument(n: i64) -> u64 {
    if n >= 0 {
        n as u64
    } else {
        (-(n + 1)) as u64
    }
}

fn head_len(argument: u64) -> usize {
    match argument {
        0..=23 => 1,
        24..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// A streaming canonical CBOR encoder.
///
/// Several values may be encoded back to back into one buffer.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Appends the encoding of `value`.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(false) => self.buffer.push(0xf4),
            Value::Bool(true) => self.buffer.push(0xf5),
            Value::Integer(n) => {
                let major = if *n >= 0 { 0 } else { 1 };
                self.write_head(major, integer_argument(*n));
            }
            Value::Bytes(b) => {
                self.write_head(2, b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.write_head(3, s.len() as u64);
                self.buffer.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.write_head(4, items.len() as u64);
                for item in items {
                    self.encode(item);
                }
            }
            Value::Map(pairs) => self.encode_map(pairs),
        }
    }

    /// Consumes the encoder and returns the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Returns the bytes encoded so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_head(&mut self, major: u8, argument: u64) {
        let mt = major << 5;
        match argument {
            0..=23 => self.buffer.push(mt | argument as u8),
            24..=0xFF => {
                self.buffer.push(mt | 24);
                self.buffer.push(argument as u8);
            }
            0x100..=0xFFFF => {
                self.buffer.push(mt | 25);
                self.buffer
                    .extend_from_slice(&(argument as u16).to_be_bytes());
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.buffer.push(mt | 26);
                self.buffer
                    .extend_from_slice(&(argument as u32).to_be_bytes());
            }
            _ => {
                self.buffer.push(mt | 27);
                self.buffer.extend_from_slice(&argument.to_be_bytes());
            }
        }
    }

    fn encode_map(&mut self, pairs: &[(Value, Value)]) {
        // Maps built through `Value::Map` directly may be unsorted.
        let mut entries: Vec<(Vec<u8>, &Value)> = pairs
            .iter()
            .map(|(k, v)| (encode_canonical(k), v))
            .collect();
        entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        self.write_head(5, entries.len() as u64);
        for (key, value) in entries {
            self.buffer.extend_from_slice(&key);
            self.encode(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_values() {
        assert_eq!(encode_canonical(&Value::Null), vec![0xf6]);
        assert_eq!(encode_canonical(&Value::Bool(false)), vec![0xf4]);
        assert_eq!(encode_canonical(&Value::Bool(true)), vec![0xf5]);
    }

    #[test]
    fn integers_use_shortest_form() {
        assert_eq!(encode_canonical(&Value::Integer(0)), vec![0x00]);
        assert_eq!(encode_canonical(&Value::Integer(23)), vec![0x17]);
        assert_eq!(encode_canonical(&Value::Integer(24)), vec![0x18, 24]);
        assert_eq!(encode_canonical(&Value::Integer(256)), vec![0x19, 0x01, 0x00]);
        assert_eq!(encode_canonical(&Value::Integer(-1)), vec![0x20]);
        assert_eq!(encode_canonical(&Value::Integer(-25)), vec![0x38, 24]);
    }

    #[test]
    fn text_and_bytes() {
        assert_eq!(
            encode_canonical(&Value::from("abc")),
            vec![0x63, b'a', b'b', b'c']
        );
        assert_eq!(encode_canonical(&Value::Bytes(vec![1, 2])), vec![0x42, 1, 2]);
    }

    #[test]
    fn unsorted_map_is_encoded_sorted() {
        let unsorted = Value::Map(vec![
            (Value::from("bb"), Value::Integer(1)),
            (Value::from("a"), Value::Integer(2)),
        ]);
        let sorted = Value::text_map([("a", 2i64), ("bb", 1)]);
        assert_eq!(encode_canonical(&unsorted), encode_canonical(&sorted));
    }

    #[test]
    fn encoded_len_matches_output() {
        let value = Value::text_map([
            ("id", Value::from("0f6c")),
            ("n", Value::Integer(-70_000)),
            ("blob", Value::Bytes(vec![7; 300])),
            (
                "tags",
                Value::Array(vec![Value::from("x"), Value::Null, Value::Bool(true)]),
            ),
        ]);
        assert_eq!(encoded_len(&value), encode_canonical(&value).len());
    }
}
