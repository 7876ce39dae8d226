//! Bencode values.
//!
//! Dictionaries keep their keys sorted, so [`encode`] is canonical and the
//! info-hash of a re-encoded `info` dictionary matches the original.

use std::collections::BTreeMap;

use crate::error::SwarmError;

/// Deepest nesting accepted by the decoder.
const MAX_DEPTH: usize = 32;

/// A bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `i<n>e`
    Int(i64),
    /// `<len>:<bytes>`
    Bytes(Vec<u8>),
    /// `l...e`
    List(Vec<Value>),
    /// `d...e`
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Byte-string value from anything byte-like.
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Self::Bytes(b.as_ref().to_vec())
    }

    /// Integer content, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Byte content, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// UTF-8 content, if this is a valid UTF-8 byte string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Dictionary content, if this is a dictionary.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up `key` in a dictionary.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}

/// Builder for dictionaries with string keys.
#[derive(Debug, Default)]
pub struct DictBuilder(BTreeMap<Vec<u8>, Value>);

impl DictBuilder {
    /// Empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.as_bytes().to_vec(), value);
        self
    }

    /// Finish the dictionary.
    #[must_use]
    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

/// Encode a value.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode exactly one value spanning all of `input`.
///
/// # Errors
///
/// Returns [`SwarmError::Bencode`] on malformed input or trailing bytes.
pub fn decode(input: &[u8]) -> Result<Value, SwarmError> {
    let (value, used) = decode_prefix(input)?;
    if used != input.len() {
        return Err(SwarmError::Bencode("trailing bytes after value".into()));
    }
    Ok(value)
}

/// Decode one value from the start of `input`, returning it and its length.
///
/// `ut_metadata` data messages put raw bytes after a dictionary, which is
/// why the decoder must report where the value stopped.
///
/// # Errors
///
/// Returns [`SwarmError::Bencode`] on malformed input.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), SwarmError> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn err(&self, msg: &str) -> SwarmError {
        SwarmError::Bencode(format!("{msg} at offset {}", self.pos))
    }

    fn peek(&self) -> Result<u8, SwarmError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.err("unexpected end of input"))
    }

    fn value(&mut self, depth: usize) -> Result<Value, SwarmError> {
        if depth > MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let n = self.integer_until(b'e')?;
                Ok(Value::Int(n))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                let mut last: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    if last.as_ref().is_some_and(|prev| *prev >= key) {
                        return Err(self.err("dictionary keys not sorted"));
                    }
                    let item = self.value(depth + 1)?;
                    last = Some(key.clone());
                    entries.insert(key, item);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            _ => Err(self.err("unexpected byte")),
        }
    }

    fn integer_until(&mut self, terminator: u8) -> Result<i64, SwarmError> {
        let start = self.pos;
        let end = self.input[start..]
            .iter()
            .position(|&b| b == terminator)
            .map(|i| start + i)
            .ok_or_else(|| self.err("unterminated integer"))?;
        let digits = &self.input[start..end];
        let valid = match digits {
            [] | [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            [b'-', rest @ ..] => rest.iter().all(u8::is_ascii_digit),
            _ => digits.iter().all(u8::is_ascii_digit),
        };
        if !valid {
            return Err(self.err("invalid integer"));
        }
        let text = std::str::from_utf8(digits).map_err(|_| self.err("invalid integer"))?;
        let n = text.parse().map_err(|_| self.err("integer out of range"))?;
        self.pos = end + 1;
        Ok(n)
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, SwarmError> {
        if !self.peek()?.is_ascii_digit() {
            return Err(self.err("expected byte string"));
        }
        let len = self.integer_until(b':')?;
        let len = usize::try_from(len).map_err(|_| self.err("negative length"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| self.err("byte string past end of input"))?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"4:spam").unwrap(), Value::bytes("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::bytes(""));
    }

    #[test]
    fn test_decode_nested() {
        let v = decode(b"d3:bar4:spam3:fooi42e4:listli1ei2eee").unwrap();
        assert_eq!(v.get("bar").and_then(Value::as_str), Some("spam"));
        assert_eq!(v.get("foo").and_then(Value::as_int), Some(42));
        assert_eq!(
            v.get("list"),
            Some(&Value::List(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn test_canonical_encoding() {
        let v = DictBuilder::new()
            .with("zeta", Value::Int(1))
            .with("alpha", Value::bytes("x"))
            .build();
        assert_eq!(encode(&v), b"d5:alpha1:x4:zetai1ee");
    }

    #[test]
    fn test_decode_prefix_reports_length() {
        let input = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (v, used) = decode_prefix(input).unwrap();
        assert_eq!(v.get("msg_type").and_then(Value::as_int), Some(1));
        assert_eq!(&input[used..], b"RAWDATA");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            &b"i01e"[..],
            b"i-0e",
            b"ie",
            b"i12",
            b"5:abc",
            b"l",
            b"d1:bi1e1:ai2ee",
            b"x",
            b"i1ei2e",
        ] {
            assert!(decode(bad).is_err(), "accepted {:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(decode(&deep).is_err());
    }
}
