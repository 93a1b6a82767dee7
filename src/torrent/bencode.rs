//! Bencode Parser
//!
//! Minimal bencode decoder/encoder that keeps access to the raw bytes of
//! the info dictionary, which is required to compute the info-hash.
//!
//! Format:
//! - Integers:   `i<number>e`        `i42e`
//! - Strings:    `<length>:<data>`   `4:spam`
//! - Lists:      `l<items>e`         `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB), so a malicious
/// torrent cannot force a huge allocation
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Maximum nesting depth for lists/dicts
const MAX_DEPTH: usize = 64;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte-string keys, sorted
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 40 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let keys: Vec<String> = d
                    .keys()
                    .map(|k| String::from_utf8_lossy(k).to_string())
                    .collect();
                f.debug_tuple("Dict").field(&keys).finish()
            }
        }
    }
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

impl BencodeValue {
    /// Parse a single bencode value, returning it with the remaining
    /// unparsed bytes.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        Self::parse_at_depth(data, 0)
    }

    /// Parse a complete bencode value, rejecting trailing data.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let (value, remaining) = Self::parse(data)?;
        if !remaining.is_empty() {
            return Err(parse_error(format!(
                "Trailing data: {} bytes",
                remaining.len()
            )));
        }
        Ok(value)
    }

    fn parse_at_depth(data: &[u8], depth: usize) -> Result<(Self, &[u8])> {
        if depth > MAX_DEPTH {
            return Err(parse_error("Nesting too deep"));
        }

        match data.first() {
            None => Err(parse_error("Empty input")),
            Some(b'i') => Self::parse_integer(data),
            Some(b'l') => Self::parse_list(data, depth),
            Some(b'd') => Self::parse_dict(data, depth),
            Some(b'0'..=b'9') => Self::parse_bytes(data),
            Some(&c) => Err(parse_error(format!(
                "Invalid type marker: {:?}",
                c as char
            ))),
        }
    }

    fn parse_integer(data: &[u8]) -> Result<(Self, &[u8])> {
        let end = data[1..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| parse_error("Unterminated integer"))?;

        let digits = &data[1..1 + end];
        let text = std::str::from_utf8(digits).map_err(|_| parse_error("Non-ASCII integer"))?;

        // Bencode forbids leading zeros and bare "-"
        if text.is_empty()
            || text == "-"
            || (text.len() > 1 && text.starts_with('0'))
            || (text.len() > 2 && text.starts_with("-0"))
            || text == "-0"
        {
            return Err(parse_error(format!("Malformed integer: {:?}", text)));
        }

        let value: i64 = text
            .parse()
            .map_err(|_| parse_error(format!("Integer out of range: {:?}", text)))?;

        Ok((Self::Integer(value), &data[end + 2..]))
    }

    fn parse_bytes(data: &[u8]) -> Result<(Self, &[u8])> {
        let colon = data
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_error("Missing ':' in string"))?;

        let len_text =
            std::str::from_utf8(&data[..colon]).map_err(|_| parse_error("Bad string length"))?;
        let len: usize = len_text
            .parse()
            .map_err(|_| parse_error(format!("Bad string length: {:?}", len_text)))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!("String too long: {} bytes", len)));
        }

        let start = colon + 1;
        let bytes = data
            .get(start..start + len)
            .ok_or_else(|| parse_error("Truncated string"))?;

        Ok((Self::Bytes(bytes.to_vec()), &data[start + len..]))
    }

    fn parse_list(data: &[u8], depth: usize) -> Result<(Self, &[u8])> {
        let mut rest = &data[1..];
        let mut items = Vec::new();

        loop {
            match rest.first() {
                None => return Err(parse_error("Unterminated list")),
                Some(b'e') => return Ok((Self::List(items), &rest[1..])),
                Some(_) => {
                    let (item, remaining) = Self::parse_at_depth(rest, depth + 1)?;
                    items.push(item);
                    rest = remaining;
                }
            }
        }
    }

    fn parse_dict(data: &[u8], depth: usize) -> Result<(Self, &[u8])> {
        let mut rest = &data[1..];
        let mut dict = BTreeMap::new();

        loop {
            match rest.first() {
                None => return Err(parse_error("Unterminated dictionary")),
                Some(b'e') => return Ok((Self::Dict(dict), &rest[1..])),
                Some(_) => {
                    let (key, remaining) = Self::parse_at_depth(rest, depth + 1)?;
                    let Self::Bytes(key) = key else {
                        return Err(parse_error("Dictionary key must be a string"));
                    };
                    let (value, remaining) = Self::parse_at_depth(remaining, depth + 1)?;
                    dict.insert(key, value);
                    rest = remaining;
                }
            }
        }
    }

    /// Encode back to bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(dict) => {
                buf.push(b'd');
                for (key, value) in dict {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Interpret as UTF-8 string.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Interpret as integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Interpret as non-negative integer.
    pub fn as_uint(&self) -> Option<u64> {
        self.as_int().and_then(|n| u64::try_from(n).ok())
    }

    /// Interpret as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Interpret as list.
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Interpret as dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup by string key.
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}

/// Locate the raw bytes of the `info` dictionary inside a metainfo file.
///
/// The info-hash is the SHA-1 of these exact bytes, so they must be sliced
/// out of the original input rather than re-encoded.
pub fn find_info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'd') {
        return Err(parse_error("Metainfo root must be a dictionary"));
    }

    let mut rest = &data[1..];
    loop {
        if rest.first() == Some(&b'e') {
            return Err(parse_error("Metainfo has no 'info' key"));
        }

        let (key, after_key) = BencodeValue::parse(rest)?;
        let is_info = matches!(&key, BencodeValue::Bytes(k) if k == b"info");

        let before_value = after_key;
        let (_, after_value) = BencodeValue::parse(before_value)?;

        if is_info {
            let len = before_value.len() - after_value.len();
            return Ok(&before_value[..len]);
        }
        rest = after_value;
    }
}
