//! String decoding helpers for minidump-embedded text.
//!
//! Minidump strings are u32-length-prefixed UTF-16; the Linux extension
//! streams are raw bytes from procfs. All decoding here is lossy (ill-formed
//! sequences become U+FFFD) since dump contents are untrusted.

use std::borrow::Cow;

use encoding_rs::{UTF_16BE, UTF_16LE};
use scroll::Pread;

/// Read a u32-length-prefixed UTF-16 string at `*offset` within `bytes`.
///
/// The length is a byte count and must be even and in bounds; the contents
/// decode lossily. On success `*offset` is left after the string.
pub fn read_string_utf16(
    offset: &mut usize,
    bytes: &[u8],
    endian: scroll::Endian,
) -> Option<String> {
    let length: u32 = bytes.gread_with(offset, endian).ok()?;
    let size = length as usize;
    if size % 2 != 0 || size > bytes.len().checked_sub(*offset)? {
        return None;
    }
    let encoding = match endian {
        scroll::Endian::Little => UTF_16LE,
        scroll::Endian::Big => UTF_16BE,
    };
    let (decoded, _, _) = encoding.decode(&bytes[*offset..*offset + size]);
    *offset += size;
    Some(decoded.into_owned())
}

/// Decode a NUL-terminated UTF-16 buffer (fixed-size record fields).
pub fn utf16_to_string(data: &[u16]) -> Option<String> {
    let len = data.iter().take_while(|c| **c != 0).count();
    char::decode_utf16(data[..len].iter().copied())
        .map(|c| c.map_err(|_| ()))
        .collect::<Result<String, ()>>()
        .ok()
}

/// Read a u32-length-prefixed, NUL-terminated UTF-8 string (Crashpad style).
pub fn read_string_utf8<'a>(
    offset: &mut usize,
    bytes: &'a [u8],
    endian: scroll::Endian,
) -> Option<&'a str> {
    let length: u32 = bytes.gread_with(offset, endian).ok()?;
    let slice = bytes.gread_with(offset, length as usize).ok()?;
    match bytes.gread(offset) {
        Ok(0u8) => std::str::from_utf8(slice).ok(),
        _ => None,
    }
}

/// Interpret `bytes` up to the first NUL as a lossy string.
pub fn string_from_bytes_nul(bytes: &[u8]) -> Option<Cow<'_, str>> {
    bytes.split(|&b| b == 0).next().map(String::from_utf8_lossy)
}

/// Render `bytes` as lowercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Split procfs-style `key: value` (or `KEY=value`) line data.
///
/// Yields trimmed, unquoted key/value pairs; lines without the separator are
/// skipped. Values decode lossily since procfs contents are raw bytes.
pub fn linux_list_iter(
    bytes: &[u8],
    separator: u8,
) -> impl Iterator<Item = (Cow<'_, str>, Cow<'_, str>)> {
    fn strip_quotes(input: &[u8]) -> &[u8] {
        let input = trim_ascii(input);
        input
            .strip_prefix(b"\"")
            .and_then(|input| input.strip_suffix(b"\""))
            .unwrap_or(input)
    }

    bytes
        .split(|&b| b == b'\n')
        .filter_map(move |line| {
            let pos = line.iter().position(|&b| b == separator)?;
            let (key, val) = line.split_at(pos);
            Some((
                String::from_utf8_lossy(strip_quotes(key)),
                String::from_utf8_lossy(strip_quotes(&val[1..])),
            ))
        })
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod test {
    use super::*;
    use scroll::LE;

    #[test]
    fn test_read_string_utf16() {
        // length prefix 8, "name"
        let bytes = b"\x08\x00\x00\x00n\x00a\x00m\x00e\x00";
        let mut offset = 0;
        assert_eq!(
            read_string_utf16(&mut offset, bytes, LE).as_deref(),
            Some("name")
        );
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn test_read_string_utf16_lossy() {
        // An unpaired surrogate decodes as U+FFFD instead of failing.
        let bytes = b"\x02\x00\x00\x00\x00\xd8";
        let mut offset = 0;
        assert_eq!(
            read_string_utf16(&mut offset, bytes, LE).as_deref(),
            Some("\u{fffd}")
        );
    }

    #[test]
    fn test_read_string_utf16_bounds() {
        let bytes = b"\xff\x00\x00\x00ab";
        let mut offset = 0;
        assert_eq!(read_string_utf16(&mut offset, bytes, LE), None);
    }

    #[test]
    fn test_linux_list_iter() {
        let data = b"DISTRIB_ID=Ubuntu\nDISTRIB_CODENAME=\"jammy\"\nnonsense\n";
        let pairs: Vec<_> = linux_list_iter(data, b'=').collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "DISTRIB_ID");
        assert_eq!(pairs[0].1, "Ubuntu");
        assert_eq!(pairs[1].1, "jammy");
    }
}
