/// UTF-8, or Latin-1 when the bytes are not valid UTF-8. Latin-1 maps every
/// byte to the code point of the same value, so it never fails.
pub(super) fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Non-blank blocks separated by blank lines.
pub(super) fn count_paragraphs(text: &str) -> usize {
    let mut count = 0;
    let mut in_block = false;
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if !blank && !in_block {
            count += 1;
        }
        in_block = !blank;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode("naïve café".as_bytes()), "naïve café");
    }

    #[test]
    fn test_decode_falls_back_to_latin1() {
        // 0xE9 alone is invalid UTF-8 and is 'é' in Latin-1.
        assert_eq!(decode(&[b'c', b'a', b'f', 0xE9]), "café");
    }

    #[test]
    fn test_count_paragraphs() {
        assert_eq!(count_paragraphs(""), 0);
        assert_eq!(count_paragraphs("one line"), 1);
        assert_eq!(count_paragraphs("a\nb\n\n  \nc\n\n\nd"), 3);
        assert_eq!(count_paragraphs("\n\nlead\n"), 1);
    }
}
