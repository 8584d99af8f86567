//! Text helpers shared by the prompt pipelines

use std::borrow::Cow;

/// Case-insensitive text operations without allocation when possible
pub struct TextUtils;

impl TextUtils {
    /// Check if text contains pattern (case-insensitive)
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        if pattern.len() > text.len() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Strip a leading ```` ```sql ```` / ```` ``` ```` marker and a trailing
    /// ```` ``` ```` marker from a model reply, then trim.
    pub fn strip_code_fences(text: &str) -> &str {
        let mut body = text.trim();

        if let Some(rest) = body.strip_prefix("```") {
            let (first_line, after_first_line) = match rest.find('\n') {
                Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
                None => (rest, None),
            };
            let inline_sql_tag = rest.get(..3).is_some_and(|tag| tag.eq_ignore_ascii_case("sql"))
                && rest[3..].starts_with(char::is_whitespace);

            body = match after_first_line {
                Some(after) if Self::is_fence_info(first_line.trim()) => after,
                _ if inline_sql_tag => &rest[3..],
                _ => rest,
            };
        }

        if let Some(rest) = body.trim_end().strip_suffix("```") {
            body = rest;
        }

        body.trim()
    }

    fn is_fence_info(info: &str) -> bool {
        info.is_empty()
            || (info.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                && !info.eq_ignore_ascii_case("select")
                && !info.eq_ignore_ascii_case("with"))
    }

    /// Truncate text to max characters with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sql_fence() {
        assert_eq!(TextUtils::strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn test_strip_bare_fence() {
        assert_eq!(
            TextUtils::strip_code_fences("```\nSELECT * FROM t\n```\n"),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn test_strip_inline_fence() {
        assert_eq!(TextUtils::strip_code_fences("```sql SELECT 1```"), "SELECT 1");
    }

    #[test]
    fn test_strip_fence_without_info_string_keeps_statement() {
        assert_eq!(
            TextUtils::strip_code_fences("```SELECT id FROM t\n```"),
            "SELECT id FROM t"
        );
        assert_eq!(TextUtils::strip_code_fences("```select\n1\n```"), "select\n1");
    }

    #[test]
    fn test_strip_leaves_unfenced_text() {
        assert_eq!(TextUtils::strip_code_fences("  SELECT 1  "), "SELECT 1");
        assert_eq!(TextUtils::strip_code_fences("YES"), "YES");
    }

    #[test]
    fn test_contains_ignore_case() {
        assert!(TextUtils::contains_ignore_case("Show me ALL rows", "show"));
        assert!(TextUtils::contains_ignore_case("HOW MANY orders?", "how many"));
        assert!(!TextUtils::contains_ignore_case("hello", "list"));
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
        assert_eq!(TextUtils::truncate_with_ellipsis("a longer line", 8), "a lon...");
        assert_eq!(TextUtils::truncate_with_ellipsis("abcdef", 2), "...");
    }
}
