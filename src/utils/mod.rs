//! Small helpers shared across modules

/// Longest slice of message content written to debug logs.
pub const LOG_PREVIEW_BYTES: usize = 80;

/// Truncate a string to at most `max_bytes` bytes, ensuring the cut lands on a
/// valid UTF-8 char boundary. Returns the longest prefix that fits.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Content preview for log lines.
pub fn preview(content: Option<&str>) -> String {
    match content {
        None => "<none>".to_string(),
        Some(s) if s.len() > LOG_PREVIEW_BYTES => {
            format!("{}...", truncate_str(s, LOG_PREVIEW_BYTES))
        }
        Some(s) => s.to_string(),
    }
}

/// Compare two secrets without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_ascii() {
        assert_eq!(truncate_str("bom dia", 3), "bom");
        assert_eq!(truncate_str("oi", 10), "oi");
        assert_eq!(truncate_str("", 0), "");
    }

    #[test]
    fn test_truncate_str_multibyte_boundary() {
        // "ç" is 2 bytes; "olá" ends with a 2-byte char
        assert_eq!(truncate_str("olá", 3), "ol");
        assert_eq!(truncate_str("olá", 4), "olá");
        // 🦀 is 4 bytes
        assert_eq!(truncate_str("hi🦀", 5), "hi");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(None), "<none>");
        assert_eq!(preview(Some("hi")), "hi");
        let long = "x".repeat(200);
        let p = preview(Some(&long));
        assert_eq!(p.len(), LOG_PREVIEW_BYTES + 3);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(constant_time_eq(b"", b""));
    }
}
