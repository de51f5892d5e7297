/// Telegram rejects `sendMessage` text longer than this many UTF-16 code units.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

/// Splits `text` into consecutive pieces of at most `max_units` UTF-16 code units, the unit
/// Telegram measures message length in.
///
/// Splits on character boundaries, never inside a code point, so a character wider than
/// `max_units` still gets a chunk of its own. Empty input yields no chunks.
pub fn chunk_text(text: &str, max_units: usize) -> Vec<String> {
    let max_units = max_units.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut units = 0usize;
    for ch in text.chars() {
        let width = ch.len_utf16();
        if units + width > max_units && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            units = 0;
        }
        current.push(ch);
        units += width;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16_len(s: &str) -> usize {
        s.chars().map(char::len_utf16).sum()
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_text("hello", 4096), vec!["hello".to_string()]);
        assert!(chunk_text("", 4096).is_empty());
    }

    #[test]
    fn long_text_is_split_in_order_at_the_limit() {
        let text = "a".repeat(4096) + &"b".repeat(4096) + "c";
        let chunks = chunk_text(&text, TELEGRAM_MAX_MESSAGE_CHARS);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert_eq!(chunks[0].chars().count(), 4096);
        assert!(chunks[1].chars().all(|c| c == 'b'));
        assert_eq!(chunks[2], "c");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn accented_characters_count_as_one_unit() {
        let chunks = chunk_text("héllo wörld", 4);
        assert_eq!(chunks, vec!["héll", "o wö", "rld"]);
    }

    #[test]
    fn astral_characters_count_as_two_units() {
        let text = "😀".repeat(3000);
        let chunks = chunk_text(&text, TELEGRAM_MAX_MESSAGE_CHARS);
        assert_eq!(chunks.len(), 2);
        assert_eq!(utf16_len(&chunks[0]), 4096);
        assert_eq!(chunks[0].chars().count(), 2048);
        assert!(chunks.iter().all(|c| utf16_len(c) <= TELEGRAM_MAX_MESSAGE_CHARS));
        assert_eq!(chunks.concat(), text);

        // An odd limit never splits a surrogate pair.
        assert_eq!(chunk_text("a😀b", 2), vec!["a", "😀", "b"]);
        assert_eq!(chunk_text("😀", 1), vec!["😀"]);
    }
}
