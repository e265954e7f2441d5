use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended in the middle of a value")]
    Truncated,
    #[error("malformed integer")]
    BadInteger,
    #[error("malformed string length")]
    BadLength,
    #[error("dictionary key is not a byte string")]
    BadDictKey,
    #[error("trailing bytes after the value")]
    Trailing,
}

/// One bencode value. Byte strings are raw bytes, never assumed to be
/// UTF-8: `pieces` in a torrent is a run of binary SHA-1 digests.
///
/// Dictionaries use a `BTreeMap` so encoding emits keys in lexicographic
/// byte order without a separate sort pass.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Serializes a value. Total over all four variants; dictionary keys come
/// out in canonical (lexicographic) order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(&mut out, value);
    out
}

fn encode_into(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(out, item);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(out, val);
            }
            out.push(b'e');
        }
    }
}

/// Parses exactly one value from the front of `input` and reports how many
/// bytes it consumed.
pub fn decode(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut parser = Parser::new(input);
    let value = parser.value()?;
    Ok((value, parser.pos))
}

/// Like [`decode`] but requires the value to span the whole input.
pub fn decode_exact(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode(input)?;
    if consumed != input.len() {
        return Err(BencodeError::Trailing);
    }
    Ok(value)
}

/// Byte range of the raw encoded value stored under `key` in a top-level
/// dictionary.
///
/// `info_hash` must be computed over the exact bytes of the source file;
/// re-encoding a parsed dictionary would silently normalize whatever the
/// torrent's author wrote. Walking the original buffer sidesteps that.
pub fn dict_entry_span(input: &[u8], key: &[u8]) -> Result<Option<Range<usize>>, BencodeError> {
    let mut parser = Parser::new(input);
    if parser.peek()? != b'd' {
        return Err(BencodeError::BadDictKey);
    }
    parser.pos += 1;
    loop {
        if parser.peek()? == b'e' {
            return Ok(None);
        }
        let entry_key = parser.byte_string()?;
        let start = parser.pos;
        parser.value()?;
        if entry_key == key {
            return Ok(Some(start..parser.pos));
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Parser<'a> {
        Parser { input, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.input.get(self.pos).copied().ok_or(BencodeError::Truncated)
    }

    fn value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.integer().map(Value::Int),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            b'l' => self.list().map(Value::List),
            b'd' => self.dict().map(Value::Dict),
            _ => Err(BencodeError::BadLength),
        }
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        self.pos += 1; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.pos += 1; // 'e'

        // BEP 3: no empty body, no leading zeros except "i0e", no "-0".
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || !unsigned.iter().all(u8::is_ascii_digit)
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || digits == b"-0"
        {
            return Err(BencodeError::BadInteger);
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::BadInteger)
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start || self.peek()? != b':' {
            return Err(BencodeError::BadLength);
        }
        let len: usize = std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::BadLength)?;
        self.pos += 1; // ':'
        if self.input.len() - self.pos < len {
            return Err(BencodeError::Truncated);
        }
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<Vec<Value>, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1; // 'e'
        Ok(items)
    }

    fn dict(&mut self) -> Result<BTreeMap<Vec<u8>, Value>, BencodeError> {
        self.pos += 1; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            // keys must be byte strings; out-of-order keys are tolerated
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::BadDictKey);
            }
            let key = self.byte_string()?;
            let value = self.value()?;
            entries.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_encode_primitives() {
        assert_eq!(encode(&Value::Int(0)), b"i0e");
        assert_eq!(encode(&Value::Int(-7)), b"i-7e");
        assert_eq!(encode(&bytes("announce")), b"8:announce");
        assert_eq!(
            encode(&Value::List(vec![Value::Int(1), Value::Int(2)])),
            b"li1ei2ee"
        );
        let dict = Value::Dict(BTreeMap::from([(b"a".to_vec(), bytes("1"))]));
        assert_eq!(encode(&dict), b"d1:a1:1e");
    }

    #[test]
    fn test_decode_metainfo_shape() {
        let raw = b"d8:announce3:foo4:infod6:lengthi3e4:name3:baree";
        let value = decode_exact(raw).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict[b"announce".as_slice()], bytes("foo"));
        let info = dict[b"info".as_slice()].as_dict().unwrap();
        assert_eq!(info[b"length".as_slice()], Value::Int(3));
        assert_eq!(info[b"name".as_slice()], bytes("bar"));
        // round-trip law: re-encoding reproduces the source bytes
        assert_eq!(encode(&value), raw);
    }

    #[test]
    fn test_decode_reports_consumed() {
        let (value, consumed) = decode(b"i42etrailing").unwrap();
        assert_eq!(value, Value::Int(42));
        assert_eq!(consumed, 4);
        assert_eq!(decode_exact(b"i42etrailing"), Err(BencodeError::Trailing));
    }

    #[test]
    fn test_decode_rejects_bad_integers() {
        assert_eq!(decode(b"ie"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i-0e"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i03e"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i1x2e"), Err(BencodeError::BadInteger));
        assert_eq!(decode(b"i42"), Err(BencodeError::Truncated));
    }

    #[test]
    fn test_decode_rejects_bad_strings() {
        assert_eq!(decode(b"5:abc"), Err(BencodeError::Truncated));
        assert_eq!(decode(b":abc"), Err(BencodeError::BadLength));
        assert_eq!(decode(b"x"), Err(BencodeError::BadLength));
    }

    #[test]
    fn test_decode_rejects_bad_dict_keys() {
        assert_eq!(decode(b"di1e3:fooe"), Err(BencodeError::BadDictKey));
    }

    #[test]
    fn test_decode_raw_byte_strings() {
        // a byte string holding non-UTF-8 data must survive untouched
        let raw = [b'4', b':', 0xde, 0xad, 0xbe, 0xef];
        let (value, _) = decode(&raw).unwrap();
        assert_eq!(value.as_bytes().unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_round_trip_nested() {
        let raw = b"d4:listl4:spami42ee3:str0:e".to_vec();
        let value = decode_exact(&raw).unwrap();
        assert_eq!(encode(&value), raw);
    }

    #[test]
    fn test_dict_entry_span() {
        let raw = b"d8:announce3:foo4:infod6:lengthi3e4:name3:baree";
        let span = dict_entry_span(raw, b"info").unwrap().unwrap();
        assert_eq!(&raw[span], b"d6:lengthi3e4:name3:baree");
        assert_eq!(dict_entry_span(raw, b"nope").unwrap(), None);
        assert_eq!(dict_entry_span(b"le", b"info"), Err(BencodeError::BadDictKey));
    }
}
