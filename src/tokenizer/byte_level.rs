//! GPT-2 byte-level alphabet.
//!
//! Byte-level vocabularies never store raw bytes. Every byte is first mapped
//! to a printable unicode character: printable ASCII and most of Latin-1 map
//! to themselves, everything else (control bytes, space, 0x7F..=0xA0, 0xAD)
//! is shifted up to U+0100 and beyond. A space therefore shows up in vocab
//! files as `Ġ` (U+0120).

/// Bytes that keep their own code point.
const fn is_printable(b: u8) -> bool {
    matches!(b, 0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF)
}

const fn build_byte_to_char() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    let mut b = 0usize;
    while b < 256 {
        let code = if is_printable(b as u8) {
            b as u32
        } else {
            shifted += 1;
            255 + shifted
        };
        table[b] = match char::from_u32(code) {
            Some(c) => c,
            None => '\0',
        };
        b += 1;
    }
    table
}

/// 68 bytes are shifted, so the highest code point in use is U+0143.
const CHAR_TABLE_LEN: usize = 0x144;

const fn build_char_to_byte() -> [Option<u8>; CHAR_TABLE_LEN] {
    let forward = build_byte_to_char();
    let mut table = [None; CHAR_TABLE_LEN];
    let mut b = 0usize;
    while b < 256 {
        table[forward[b] as usize] = Some(b as u8);
        b += 1;
    }
    table
}

static BYTE_TO_CHAR: [char; 256] = build_byte_to_char();
static CHAR_TO_BYTE: [Option<u8>; CHAR_TABLE_LEN] = build_char_to_byte();

/// The full byte → character table, indexed by byte value.
pub fn bytes_to_unicode() -> &'static [char; 256] {
    &BYTE_TO_CHAR
}

#[inline]
pub(crate) fn byte_to_char(b: u8) -> char {
    BYTE_TO_CHAR[b as usize]
}

#[inline]
pub(crate) fn char_to_byte(c: char) -> Option<u8> {
    CHAR_TO_BYTE.get(c as usize).copied().flatten()
}

/// Raw bytes behind a vocabulary symbol.
///
/// Characters outside the alphabet are kept as their UTF-8 encoding, so
/// symbols from vocabularies that mix in literal text still decode.
pub(crate) fn symbol_to_bytes(symbol: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(symbol.len());
    for c in symbol.chars() {
        match char_to_byte(c) {
            Some(b) => out.push(b),
            None => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn alphabet_is_a_bijection() {
        let chars: HashSet<char> = bytes_to_unicode().iter().copied().collect();
        assert_eq!(chars.len(), 256);

        for b in 0..=255u8 {
            assert_eq!(char_to_byte(byte_to_char(b)), Some(b));
        }
    }

    #[test]
    fn well_known_mappings() {
        assert_eq!(byte_to_char(b'a'), 'a');
        assert_eq!(byte_to_char(b' '), '\u{120}');
        assert_eq!(byte_to_char(b'\n'), '\u{10A}');
        assert_eq!(byte_to_char(0xAD), '\u{143}');
    }

    #[test]
    fn symbols_outside_alphabet_keep_utf8() {
        assert_eq!(symbol_to_bytes("\u{120}hi"), b" hi".to_vec());
        assert_eq!(symbol_to_bytes("\u{2581}"), "\u{2581}".as_bytes().to_vec());
    }
}
