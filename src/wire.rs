//! Parser and builder for the treadmill's bracketed wire protocol.
//!
//! The bus carries printable-ASCII fields framed as `[key]` or
//! `[key:value]`. Console-to-motor frames are terminated with a single
//! `0xFF`; either direction may interleave `0x00` bytes, which are
//! ignored. Speed travels as hundredths-of-mph rendered in uppercase hex.
//!
//! Everything in this module is a pure function over byte slices (no
//! I/O, no state), so the same code serves both serial directions and the
//! emulation cycle builder.
//!
//! # Example
//!
//! ```rust
//! use treadmill_io::wire::{build_kv, parse_kv};
//!
//! let frame = build_kv("hmph", "78");
//! assert_eq!(frame, b"[hmph:78]\xff");
//!
//! let (pairs, consumed) = parse_kv(&frame, 32);
//! assert_eq!(consumed, frame.len());
//! assert_eq!(pairs[0].key, "hmph");
//! assert_eq!(pairs[0].value, "78");
//! ```

/// Frame terminator on the console-to-motor direction.
pub const FRAME_TERMINATOR: u8 = 0xFF;

/// Longest key or value the bus carries (inner frame length cap).
pub const MAX_FIELD_LEN: usize = 63;

/// One parsed `[key]` or `[key:value]` field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvPair {
    /// Field key (1-63 printable ASCII bytes).
    pub key: String,
    /// Field value; empty for bare `[key]` fields.
    pub value: String,
}

impl KvPair {
    /// Convenience constructor, mainly for tests.
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

fn printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// Parse bracketed fields out of a raw byte buffer.
///
/// Scans left to right, skipping `0xFF`/`0x00` delimiters and any stray
/// bytes between frames. Stops at `max_pairs` or at an unterminated `[`,
/// whose bytes are left unconsumed for the next call. Frames containing
/// non-printable bytes or an out-of-range inner length are dropped, but
/// their bytes still count as consumed.
///
/// Returns the parsed pairs and the length of the consumed prefix.
pub fn parse_kv(buf: &[u8], max_pairs: usize) -> (Vec<KvPair>, usize) {
    let mut pairs = Vec::new();
    let mut i = 0;

    while i < buf.len() && pairs.len() < max_pairs {
        match buf[i] {
            0xFF | 0x00 => {
                i += 1;
            }
            b'[' => {
                let Some(end) = buf[i + 1..].iter().position(|&b| b == b']') else {
                    break; // incomplete frame, keep for next call
                };
                let inner = &buf[i + 1..i + 1 + end];

                if !inner.is_empty()
                    && inner.len() <= MAX_FIELD_LEN
                    && inner.iter().all(|&b| printable(b))
                {
                    // Inner bytes are printable ASCII, so from_utf8 cannot fail
                    let content = core::str::from_utf8(inner).unwrap_or("");
                    let (key, value) = match content.find(':') {
                        Some(pos) => (&content[..pos], &content[pos + 1..]),
                        None => (content, ""),
                    };
                    pairs.push(KvPair::new(key, value));
                }
                i += end + 2; // past the ']'
            }
            _ => {
                i += 1;
            }
        }
    }

    (pairs, i)
}

/// Build a field in wire format: `[key:value]\xFF`, or `[key]\xFF` when
/// the value is empty.
pub fn build_kv(key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + value.len() + 4);
    out.push(b'[');
    out.extend_from_slice(key.as_bytes());
    if !value.is_empty() {
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.push(b']');
    out.push(FRAME_TERMINATOR);
    out
}

/// Encode a speed in tenths of mph as the wire's hundredths-of-mph
/// uppercase hex string.
///
/// ```rust
/// use treadmill_io::wire::encode_speed_hex;
///
/// assert_eq!(encode_speed_hex(12), "78");   // 1.2 mph
/// assert_eq!(encode_speed_hex(120), "4B0"); // 12.0 mph
/// assert_eq!(encode_speed_hex(0), "0");
/// ```
pub fn encode_speed_hex(tenths: i32) -> String {
    format!("{:X}", tenths * 10)
}

/// Decode a wire speed (hundredths of mph in hex, either case) back to
/// tenths, rounding half up. Returns `None` for empty, overlong, or
/// non-hex input.
///
/// ```rust
/// use treadmill_io::wire::decode_speed_hex;
///
/// assert_eq!(decode_speed_hex("78"), Some(12));
/// assert_eq!(decode_speed_hex("4b0"), Some(120));
/// assert_eq!(decode_speed_hex(""), None);
/// assert_eq!(decode_speed_hex("zz"), None);
/// ```
pub fn decode_speed_hex(hex: &str) -> Option<i32> {
    if hex.is_empty() || hex.len() > 10 {
        return None;
    }
    let hundredths = u64::from_str_radix(hex, 16).ok()?;
    Some(((hundredths + 5) / 10) as i32)
}

/// Encode a whole-percent incline as the bus's half-percent uppercase hex
/// coding (ingress translation only; the motor is commanded in decimal).
pub fn encode_incline_hex(percent: i32) -> String {
    format!("{:X}", percent * 2)
}

/// Decode a half-percent hex incline back to whole percent, rounding up
/// on the half. Returns `None` for empty, overlong, or non-hex input.
pub fn decode_incline_hex(hex: &str) -> Option<i32> {
    if hex.is_empty() || hex.len() > 10 {
        return None;
    }
    let half_pct = u64::from_str_radix(hex, 16).ok()?;
    Some(((half_pct + 1) / 2) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // parse_kv
    // =========================================================================

    #[test]
    fn parse_single_pair() {
        let (pairs, consumed) = parse_kv(b"[hmph:78]\xff", 32);
        assert_eq!(pairs, vec![KvPair::new("hmph", "78")]);
        assert_eq!(consumed, 10);
    }

    #[test]
    fn parse_bare_key() {
        let (pairs, _) = parse_kv(b"[belt]\xff", 32);
        assert_eq!(pairs, vec![KvPair::new("belt", "")]);
    }

    #[test]
    fn parse_multiple_pairs() {
        let (pairs, consumed) = parse_kv(b"[inc:7]\xff[hmph:1F4]\xff[belt]\xff", 32);
        assert_eq!(
            pairs,
            vec![
                KvPair::new("inc", "7"),
                KvPair::new("hmph", "1F4"),
                KvPair::new("belt", ""),
            ]
        );
        assert_eq!(consumed, 26);
    }

    #[test]
    fn parse_skips_nul_delimiters() {
        let (pairs, consumed) = parse_kv(b"\x00\x00[err]\x00[vbus]", 32);
        assert_eq!(pairs, vec![KvPair::new("err", ""), KvPair::new("vbus", "")]);
        assert_eq!(consumed, 14);
    }

    #[test]
    fn parse_skips_stray_bytes_between_frames() {
        let (pairs, _) = parse_kv(b"ab[inc:3]cd[belt]", 32);
        assert_eq!(pairs, vec![KvPair::new("inc", "3"), KvPair::new("belt", "")]);
    }

    #[test]
    fn parse_incomplete_frame_left_unconsumed() {
        let (pairs, consumed) = parse_kv(b"[hmph:78]\xff[inc", 32);
        assert_eq!(pairs.len(), 1);
        assert_eq!(consumed, 10); // "[inc" stays for the next call
    }

    #[test]
    fn parse_bare_open_bracket_returns_nothing() {
        let (pairs, consumed) = parse_kv(b"[", 32);
        assert!(pairs.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn parse_partial_key_returns_nothing() {
        let (pairs, consumed) = parse_kv(b"[abc", 32);
        assert!(pairs.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn parse_rejects_nonprintable_content() {
        // Frame body holds a control byte: dropped, but consumed past ']'
        let (pairs, consumed) = parse_kv(b"[bad\x01key]", 32);
        assert!(pairs.is_empty());
        assert_eq!(consumed, 10);
    }

    #[test]
    fn parse_rejects_empty_frame() {
        let (pairs, consumed) = parse_kv(b"[]", 32);
        assert!(pairs.is_empty());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn parse_rejects_overlong_frame() {
        let mut buf = vec![b'['];
        buf.extend(std::iter::repeat(b'a').take(64));
        buf.push(b']');
        let (pairs, consumed) = parse_kv(&buf, 32);
        assert!(pairs.is_empty());
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn parse_splits_on_first_colon_only() {
        let (pairs, _) = parse_kv(b"[ver:1:2:3]", 32);
        assert_eq!(pairs, vec![KvPair::new("ver", "1:2:3")]);
    }

    #[test]
    fn parse_respects_max_pairs() {
        let (pairs, consumed) = parse_kv(b"[a:1][b:2][c:3]", 2);
        assert_eq!(pairs.len(), 2);
        assert_eq!(consumed, 10); // "[c:3]" untouched
    }

    #[test]
    fn parse_build_round_trip() {
        for (key, value) in [("hmph", "4B0"), ("inc", "7"), ("belt", ""), ("loop", "5550")] {
            let frame = build_kv(key, value);
            let (pairs, consumed) = parse_kv(&frame, 32);
            assert_eq!(pairs, vec![KvPair::new(key, value)]);
            assert_eq!(consumed, frame.len());
        }
    }

    // =========================================================================
    // build_kv
    // =========================================================================

    #[test]
    fn build_with_value() {
        assert_eq!(build_kv("inc", "7"), b"[inc:7]\xff");
    }

    #[test]
    fn build_bare_key() {
        assert_eq!(build_kv("belt", ""), b"[belt]\xff");
    }

    // =========================================================================
    // speed codec
    // =========================================================================

    #[test]
    fn speed_encode_known_values() {
        assert_eq!(encode_speed_hex(12), "78");
        assert_eq!(encode_speed_hex(50), "1F4");
        assert_eq!(encode_speed_hex(120), "4B0");
        assert_eq!(encode_speed_hex(0), "0");
    }

    #[test]
    fn speed_decode_known_values() {
        assert_eq!(decode_speed_hex("78"), Some(12));
        assert_eq!(decode_speed_hex("1F4"), Some(50));
        assert_eq!(decode_speed_hex("4B0"), Some(120));
        assert_eq!(decode_speed_hex("4b0"), Some(120)); // lowercase accepted
        assert_eq!(decode_speed_hex("0"), Some(0));
    }

    #[test]
    fn speed_decode_rounds_to_tenths() {
        // 0x7D = 125 hundredths -> 13 tenths (half rounds up)
        assert_eq!(decode_speed_hex("7D"), Some(13));
        // 0x7C = 124 hundredths -> 12 tenths
        assert_eq!(decode_speed_hex("7C"), Some(12));
    }

    #[test]
    fn speed_decode_rejects_garbage() {
        assert_eq!(decode_speed_hex(""), None);
        assert_eq!(decode_speed_hex("xyz"), None);
        assert_eq!(decode_speed_hex("12345678901"), None);
        assert_eq!(decode_speed_hex("-5"), None);
    }

    #[test]
    fn speed_round_trip_full_range() {
        for tenths in 0..=120 {
            assert_eq!(decode_speed_hex(&encode_speed_hex(tenths)), Some(tenths));
        }
    }

    // =========================================================================
    // incline codec (half-percent ingress coding)
    // =========================================================================

    #[test]
    fn incline_encode_known_values() {
        assert_eq!(encode_incline_hex(7), "E"); // 14 half-percent units
        assert_eq!(encode_incline_hex(0), "0");
        assert_eq!(encode_incline_hex(15), "1E");
    }

    #[test]
    fn incline_decode_rounds_half_up() {
        assert_eq!(decode_incline_hex("E"), Some(7));
        assert_eq!(decode_incline_hex("F"), Some(8)); // 15 halves -> 8%
        assert_eq!(decode_incline_hex(""), None);
        assert_eq!(decode_incline_hex("g"), None);
    }

    #[test]
    fn incline_round_trip_full_range() {
        for pct in 0..=99 {
            assert_eq!(decode_incline_hex(&encode_incline_hex(pct)), Some(pct));
        }
    }
}
