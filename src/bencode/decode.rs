//! Recursive-descent bencode decoder

use tracing::trace;

use super::value::{Dict, Value};
use crate::error::{DecodeErrorKind, TorrentError};

/// Maximum nesting of lists and dictionaries
pub const MAX_DEPTH: usize = 64;

/// Decode one value starting at `offset`.
///
/// Returns the value and a byte count, not an end index: `5:hello` yields
/// 7, and `offset + consumed` is the position of whatever follows it. Trailing
/// bytes are left for the caller; extension messages rely on this to find
/// where a dictionary header ends and raw payload begins.
pub fn decode(data: &[u8], offset: usize) -> Result<(Value, usize), TorrentError> {
    let mut decoder = Decoder { data, pos: offset };
    let value = decoder.value(0)?;
    trace!("Decoded {} spanning {} bytes at offset {}", value.type_name(), decoder.pos - offset, offset);
    Ok((value, decoder.pos - offset))
}

/// Decode a complete document, rejecting anything after the top-level value
pub fn decode_all(data: &[u8]) -> Result<Value, TorrentError> {
    let (value, consumed) = decode(data, 0)?;
    if consumed != data.len() {
        return Err(TorrentError::encoding_error_at(
            format!("{} bytes after top-level value", data.len() - consumed),
            DecodeErrorKind::TrailingData,
            consumed,
        ));
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Result<Value, TorrentError> {
        if depth > MAX_DEPTH {
            return Err(TorrentError::encoding_error_at(
                "nesting too deep",
                DecodeErrorKind::UnexpectedToken,
                self.pos,
            ));
        }

        match self.peek() {
            None => Err(TorrentError::encoding_error_at(
                "expected a value",
                DecodeErrorKind::TruncatedInput,
                self.pos,
            )),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => self.bytes().map(Value::Bytes),
            Some(other) => Err(TorrentError::encoding_error_at(
                format!("unexpected byte 0x{:02x}", other),
                DecodeErrorKind::UnexpectedToken,
                self.pos,
            )),
        }
    }

    fn integer(&mut self) -> Result<Value, TorrentError> {
        let start = self.pos;
        let digits_start = start + 1;
        let end = self.data[digits_start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|p| digits_start + p)
            .ok_or_else(|| {
                TorrentError::encoding_error_at(
                    "integer has no terminating 'e'",
                    DecodeErrorKind::MalformedInteger,
                    start,
                )
            })?;

        let digits = &self.data[digits_start..end];
        let malformed = |reason: &str| {
            TorrentError::encoding_error_at(
                format!("{}: {:?}", reason, String::from_utf8_lossy(digits)),
                DecodeErrorKind::MalformedInteger,
                start,
            )
        };

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(malformed("not a decimal integer"));
        }
        if unsigned.len() > 1 && unsigned[0] == b'0' {
            return Err(malformed("leading zero"));
        }
        if digits.starts_with(b"-0") {
            return Err(malformed("negative zero"));
        }

        // ASCII digits with an optional sign are valid UTF-8
        let text = std::str::from_utf8(digits).map_err(|_| malformed("not a decimal integer"))?;
        let value: i64 = text.parse().map_err(|_| malformed("out of range"))?;

        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, TorrentError> {
        let start = self.pos;
        let colon = self.data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|p| start + p)
            .ok_or_else(|| {
                TorrentError::encoding_error_at(
                    "string length has no ':' terminator",
                    DecodeErrorKind::MalformedLength,
                    start,
                )
            })?;

        let prefix = &self.data[start..colon];
        let length = std::str::from_utf8(prefix)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                TorrentError::encoding_error_at(
                    format!("invalid string length {:?}", String::from_utf8_lossy(prefix)),
                    DecodeErrorKind::MalformedLength,
                    start,
                )
            })?;

        let body_start = colon + 1;
        let remaining = self.data.len() - body_start;
        if length > remaining {
            return Err(TorrentError::encoding_error_at(
                format!("string declares {} bytes but only {} remain", length, remaining),
                DecodeErrorKind::TruncatedInput,
                start,
            ));
        }

        self.pos = body_start + length;
        Ok(self.data[body_start..self.pos].to_vec())
    }

    fn list(&mut self, depth: usize) -> Result<Value, TorrentError> {
        let start = self.pos;
        self.pos += 1;
        let mut items = Vec::new();

        loop {
            match self.peek() {
                None => {
                    return Err(TorrentError::encoding_error_at(
                        "list has no terminating 'e'",
                        DecodeErrorKind::TruncatedInput,
                        start,
                    ))
                }
                Some(b'e') => break,
                Some(_) => items.push(self.value(depth + 1)?),
            }
        }

        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, TorrentError> {
        let start = self.pos;
        self.pos += 1;
        let mut dict = Dict::new();

        loop {
            match self.peek() {
                None => {
                    return Err(TorrentError::encoding_error_at(
                        "dictionary has no terminating 'e'",
                        DecodeErrorKind::TruncatedInput,
                        start,
                    ))
                }
                Some(b'e') => break,
                Some(_) => {
                    let key_pos = self.pos;
                    let key = match self.value(depth + 1)? {
                        Value::Bytes(key) => key,
                        other => {
                            return Err(TorrentError::encoding_error_at(
                                format!("dictionary key is a {}", other.type_name()),
                                DecodeErrorKind::NonStringKey,
                                key_pos,
                            ))
                        }
                    };
                    let value = self.value(depth + 1)?;
                    // Duplicate keys: last write wins
                    dict.insert(key, value);
                }
            }
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
