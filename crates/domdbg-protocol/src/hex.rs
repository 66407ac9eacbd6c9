//! Lowercase hexadecimal helpers shared by the codec.

use std::fmt::Write;

use crate::error::Error;

/// Parses a hexadecimal field into a `u64`.
pub fn parse_u64(s: &str) -> Result<u64, Error> {
    u64::from_str_radix(s, 16).map_err(|_| Error::InvalidHex)
}

/// Decodes pairs of hex digits into bytes.
pub fn decode_bytes(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(Error::InvalidHex);
    }

    s.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = digit(pair[0])?;
            let lo = digit(pair[1])?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

/// Appends bytes as pairs of lowercase hex digits.
pub fn push_bytes(out: &mut String, bytes: &[u8]) {
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
}

/// Appends a value as `width` bytes of lowercase hex, in guest
/// (little-endian) byte order.
pub fn push_value(out: &mut String, value: u64, width: usize) {
    push_bytes(out, &value.to_le_bytes()[..width]);
}

fn digit(c: u8) -> Result<u8, Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::InvalidHex),
    }
}
