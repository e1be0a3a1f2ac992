// Small cross-cutting helpers shared by several components.

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character. Use instead of `&s[..n]`, which panics
/// on non-ASCII input.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Rough token-count estimate: chars/4 plus a small fixed overhead per
/// message, matching the heuristic used for context-budget accounting.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 4
}

/// Current UTC time as an RFC 3339 string, used for audit entries and
/// wire-facing timestamps.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld"; // contains multi-byte chars
        for n in 0..s.len() + 2 {
            let t = truncate_utf8(s, n);
            assert!(s.starts_with(t));
        }
    }

    #[test]
    fn truncate_noop_when_under_limit() {
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[test]
    fn estimate_tokens_scales_with_length() {
        assert!(estimate_tokens("a".repeat(400).as_str()) > estimate_tokens("a"));
    }

    #[test]
    fn now_rfc3339_produces_a_parseable_timestamp() {
        let s = now_rfc3339();
        assert!(chrono::DateTime::parse_from_rfc3339(&s).is_ok());
    }
}
