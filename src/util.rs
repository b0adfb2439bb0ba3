//! Shared helpers

/// Largest index `<= max_bytes` that lies on a char boundary of `s`
pub fn floor_char_boundary(s: &str, max_bytes: usize) -> usize {
    if s.len() <= max_bytes {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Cut `text` to at most `max_bytes` without splitting a character.
/// Returns whether anything was removed.
pub fn truncate_in_place(text: &mut String, max_bytes: usize) -> bool {
    let cut = floor_char_boundary(text, max_bytes);
    let truncated = cut < text.len();
    text.truncate(cut);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_inside_multibyte_char() {
        // three bytes per char
        let s = "日本語";
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 6), 6);
        assert_eq!(floor_char_boundary(s, 100), 9);
        assert_eq!(floor_char_boundary(s, 0), 0);
    }

    #[test]
    fn test_truncate_in_place() {
        let mut text = String::from("héllo");
        assert!(truncate_in_place(&mut text, 2));
        assert_eq!(text, "h");

        let mut short = String::from("ok");
        assert!(!truncate_in_place(&mut short, 10));
        assert_eq!(short, "ok");
    }
}
