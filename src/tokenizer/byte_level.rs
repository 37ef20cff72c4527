//! Byte-level re-encoding and GPT-2 style pre-tokenization.
//!
//! Every byte is given a printable, non-whitespace stand-in character so
//! that vocabulary entries can be stored as ordinary strings. Printable
//! Latin-1 bytes map to themselves; the remaining 68 bytes are assigned
//! consecutive code points from U+0100 in byte order, so a space becomes
//! `Ġ` and a newline `Ċ`.

use std::collections::HashMap;
use std::sync::LazyLock;

use fancy_regex::Regex;

use super::TokenizerError;

/// Splits contractions, letter runs, digit runs, symbol runs, and whitespace.
///
/// `\s+(?!\S)` leaves the last space of a run attached to the following word.
static PRE_TOKENIZER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+")
        .expect("valid pre-tokenizer pattern")
});

static BYTE_TO_CHAR: LazyLock<[char; 256]> = LazyLock::new(build_byte_table);

static CHAR_TO_BYTE: LazyLock<HashMap<char, u8>> = LazyLock::new(|| {
    BYTE_TO_CHAR
        .iter()
        .zip(0..=u8::MAX)
        .map(|(&c, b)| (c, b))
        .collect()
});

const fn is_self_mapped(byte: u8) -> bool {
    matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF)
}

fn build_byte_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut next = 256_u32;
    for byte in 0..=u8::MAX {
        table[usize::from(byte)] = if is_self_mapped(byte) {
            char::from(byte)
        } else {
            let c = char::from_u32(next).unwrap_or(char::REPLACEMENT_CHARACTER);
            next += 1;
            c
        };
    }
    table
}

/// Stand-in character for `byte`.
#[must_use]
pub fn byte_to_char(byte: u8) -> char {
    BYTE_TO_CHAR[usize::from(byte)]
}

/// Byte represented by `c`, if it is one of the 256 stand-ins.
#[must_use]
pub fn char_to_byte(c: char) -> Option<u8> {
    CHAR_TO_BYTE.get(&c).copied()
}

/// Re-encodes the UTF-8 bytes of `text` as stand-in characters.
#[must_use]
pub fn encode_bytes(text: &str) -> String {
    text.bytes().map(byte_to_char).collect()
}

/// Maps stand-in characters back to raw bytes.
///
/// # Errors
///
/// Returns [`TokenizerError::UnmappedCharacter`] for a character outside
/// the byte table.
pub fn decode_chars(text: &str) -> Result<Vec<u8>, TokenizerError> {
    text.chars()
        .map(|c| char_to_byte(c).ok_or(TokenizerError::UnmappedCharacter(c)))
        .collect()
}

/// Splits `text` into pre-tokens without re-encoding them.
///
/// # Errors
///
/// Returns [`TokenizerError::Pattern`] if the regex engine gives up, which
/// only happens on pathological backtracking.
pub fn pre_tokenize(text: &str) -> Result<Vec<&str>, TokenizerError> {
    PRE_TOKENIZER_RE
        .find_iter(text)
        .map(|m| m.map(|m| m.as_str()).map_err(TokenizerError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b' ', '\u{120}')]
    #[case(0, '\u{100}')]
    #[case(b'\n', '\u{10A}')]
    #[case(b'a', 'a')]
    #[case(127, '\u{121}')]
    #[case(173, '\u{143}')]
    #[case(255, '\u{FF}')]
    fn byte_table_matches_gpt2(#[case] byte: u8, #[case] expected: char) {
        assert_eq!(byte_to_char(byte), expected);
        assert_eq!(char_to_byte(expected), Some(byte));
    }

    #[rstest]
    fn byte_table_is_a_bijection() {
        assert_eq!(CHAR_TO_BYTE.len(), 256);
        assert!(BYTE_TO_CHAR.iter().all(|c| !c.is_whitespace()));
    }

    #[rstest]
    #[case("cat on mat", &["cat", " on", " mat"])]
    #[case("it's 42!", &["it", "'s", " 42", "!"])]
    #[case("a  b", &["a", " ", " b"])]
    #[case("end  ", &["end", "  "])]
    fn splits_like_gpt2(#[case] text: &str, #[case] expected: &[&str]) {
        let pieces = pre_tokenize(text).unwrap_or_else(|e| panic!("pre_tokenize: {e}"));
        assert_eq!(pieces, expected);
    }

    #[rstest]
    fn multibyte_round_trip() {
        let encoded = encode_bytes("héllo ✓");
        let bytes = decode_chars(&encoded).unwrap_or_else(|e| panic!("decode: {e}"));
        assert_eq!(String::from_utf8_lossy(&bytes), "héllo ✓");
    }

    #[rstest]
    fn rejects_foreign_characters() {
        assert!(matches!(
            decode_chars("a\u{4E2D}"),
            Err(TokenizerError::UnmappedCharacter('\u{4E2D}'))
        ));
    }
}
