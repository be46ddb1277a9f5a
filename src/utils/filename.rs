/// Maximum kept length in characters, not bytes.
///
/// Titles on the archived surface run up to 100 CJK characters; a byte-based
/// cut would overshoot filesystem limits long before 255 characters.
const MAX_FILENAME_CHARS: usize = 50;

/// Sanitize an arbitrary title fragment into a safe filename segment
///
/// Replaces path separators, reserved punctuation and control characters
/// with `_`, collapses surrounding whitespace, and truncates to
/// [`MAX_FILENAME_CHARS`] characters.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    cleaned.chars().take(MAX_FILENAME_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a/b:c*d?e"), "a_b_c_d_e");
        assert_eq!(sanitize_filename("<tag>|pipe"), "_tag___pipe");
    }

    #[test]
    fn truncates_by_characters_not_bytes() {
        let long: String = "汉".repeat(80);
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), 50);
    }

    #[test]
    fn keeps_ordinary_titles() {
        assert_eq!(sanitize_filename("赞同-一个回答"), "赞同-一个回答");
    }
}
