//! Decoder for the single-part yEnc envelope used by Usenet article bodies.
//!
//! Format: a `=ybegin ...` header line, an optional `=ypart ...` line, the
//! escaped body (CRLF-terminated lines), and a trailing `=yend ...` line.
//! Escaping: `=` is the escape character; an escaped byte decodes to
//! `(byte - 106) mod 256`, every other byte decodes to `(byte - 42) mod 256`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum YencError {
    #[error("missing =ybegin line")]
    MissingBegin,
    #[error("missing =yend line")]
    MissingEnd,
    #[error("malformed yenc header: {0}")]
    MalformedHeader(String),
    #[error("truncated escape sequence at end of body")]
    TruncatedEscape,
}

/// Metadata recovered from the `=ybegin`/`=yend` trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YencMeta {
    /// Declared decoded size, taken from `=yend size=`.
    pub size: u64,
    /// CRC32 declared in `=yend` (or `=ypart`), if present.
    pub crc32: Option<u32>,
}

/// Decode a single yEnc-enveloped article body.
///
/// A CRC mismatch is logged and surfaced via the returned bool but does not
/// fail decoding: partial-article recovery is explicitly out of scope, so
/// there is nothing useful to do with a failed check besides tell the
/// caller.
pub fn decode(raw: &[u8]) -> Result<(Vec<u8>, YencMeta, bool), YencError> {
    let mut lines = raw.split(|&b| b == b'\n');

    let begin_line = lines
        .by_ref()
        .find(|l| starts_with(l, b"=ybegin"))
        .ok_or(YencError::MissingBegin)?;
    let declared_begin_size = parse_kv_u64(begin_line, b"size").unwrap_or(0);

    let mut out = Vec::with_capacity(declared_begin_size as usize);
    let mut trailer: Option<&[u8]> = None;
    let mut pending_escape = false;

    for line in lines {
        let line = strip_cr(line);
        if starts_with(line, b"=ypart") {
            continue;
        }
        if starts_with(line, b"=yend") {
            trailer = Some(line);
            break;
        }
        decode_line(line, &mut out, &mut pending_escape);
    }
    if pending_escape {
        return Err(YencError::TruncatedEscape);
    }
    let trailer = trailer.ok_or(YencError::MissingEnd)?;
    let size = parse_kv_u64(trailer, b"size").unwrap_or(declared_begin_size);
    let crc32 = parse_kv_hex_u32(trailer, b"crc32").or(parse_kv_hex_u32(trailer, b"pcrc32"));

    let crc_ok = crc32.map(|want| crc32fast::hash(&out) == want).unwrap_or(true);

    Ok((out, YencMeta { size, crc32 }, crc_ok))
}

fn decode_line(line: &[u8], out: &mut Vec<u8>, pending_escape: &mut bool) {
    let mut iter = line.iter().copied();
    while let Some(b) = iter.next() {
        if *pending_escape {
            *pending_escape = false;
            out.push(b.wrapping_sub(106));
            continue;
        }
        if b == b'=' {
            match iter.next() {
                Some(next) => out.push(next.wrapping_sub(106)),
                None => *pending_escape = true,
            }
            continue;
        }
        out.push(b.wrapping_sub(42));
    }
}

fn starts_with(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && &line[..prefix.len()] == prefix
}

fn strip_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn find_kv<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let line = strip_cr(line);
    for token in line.split(|&b| b == b' ') {
        if let Some(eq) = token.iter().position(|&b| b == b'=') {
            if &token[..eq] == key {
                return Some(&token[eq + 1..]);
            }
        }
    }
    None
}

fn parse_kv_u64(line: &[u8], key: &[u8]) -> Option<u64> {
    find_kv(line, key).and_then(|v| std::str::from_utf8(v).ok()).and_then(|s| s.parse().ok())
}

fn parse_kv_hex_u32(line: &[u8], key: &[u8]) -> Option<u32> {
    find_kv(line, key)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| u32::from_str_radix(s.trim(), 16).ok())
}

/// Well-known fully-decoded segment sizes, used to turn a hinted (encoded)
/// size into a probable true size before a segment has ever been fetched.
const WELL_KNOWN_SIZES: &[u64] = &[716_800, 768_000, 3_584_000];

/// A hinted segment size is encoded size plus line/escape overhead. We try
/// to match it against common poster chunk sizes within a small upward
/// window (posting overhead only ever inflates, never shrinks, the
/// transmitted size), else fall back to a flat overhead discount.
pub fn probable_decoded_size(bytes_hint: u64) -> (u64, bool) {
    const WINDOW: f64 = 1.0454;
    const OVERHEAD_RATIO: f64 = 0.0204;

    for &known in WELL_KNOWN_SIZES {
        let upper = (known as f64 * WINDOW).round() as u64;
        if bytes_hint >= known && bytes_hint <= upper {
            return (known, true);
        }
    }
    let estimate = (bytes_hint as f64 * (1.0 - OVERHEAD_RATIO)).round() as u64;
    (estimate, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("=ybegin line=128 size={} name=x\r\n", data.len()).as_bytes());
        for &b in data {
            let mut enc = b.wrapping_add(42);
            if enc == b'=' || enc == b'\0' || enc == b'\n' || enc == b'\r' {
                out.push(b'=');
                enc = enc.wrapping_add(64);
            }
            out.push(enc);
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(
            format!(
                "=yend size={} crc32={:08x}\r\n",
                data.len(),
                crc32fast::hash(data)
            )
            .as_bytes(),
        );
        out
    }

    #[test]
    fn roundtrip_plain_bytes() {
        let data = b"Hello, Usenet world!".to_vec();
        let enc = encode(&data);
        let (decoded, meta, crc_ok) = decode(&enc).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(meta.size, data.len() as u64);
        assert!(crc_ok);
    }

    #[test]
    fn roundtrip_with_escape_chars() {
        let data: Vec<u8> = (0..=255u16).map(|b| b as u8).collect();
        let enc = encode(&data);
        let (decoded, _meta, crc_ok) = decode(&enc).unwrap();
        assert_eq!(decoded, data);
        assert!(crc_ok);
    }

    #[test]
    fn missing_begin_errors() {
        assert!(matches!(decode(b"garbage\r\n"), Err(YencError::MissingBegin)));
    }

    #[test]
    fn well_known_size_matched() {
        let (size, accurate) = probable_decoded_size(716_800 + 3000);
        assert_eq!(size, 716_800);
        assert!(accurate);
    }

    #[test]
    fn unknown_size_estimated_non_accurate() {
        let (size, accurate) = probable_decoded_size(1_000_000);
        assert!(!accurate);
        assert_eq!(size, 979_600);
    }
}
