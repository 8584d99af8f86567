//! Lexical safety gate for generated SQL.
//!
//! `sanitize` strips comments and `classify` screens the result against a fixed
//! deny-list. This is a conservative word-level screen, not a parser: a banned
//! word inside a string literal is rejected, and an obfuscated statement the
//! word matcher cannot see is not.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Whole words that reject a statement wherever they appear.
pub const DENY_LIST: &[&str] = &[
    "DROP",
    "DELETE",
    "TRUNCATE",
    "ALTER",
    "CREATE",
    "INSERT",
    "UPDATE",
    "EXEC",
    "EXECUTE",
    "XP_CMDSHELL",
    "SP_EXECUTESQL",
];

lazy_static! {
    static ref SELECT_WORD: Regex =
        Regex::new(r"(?i)\bSELECT\b").expect("select pattern is valid");
    static ref DENIED_WORD: Regex = Regex::new(&format!(r"(?i)\b(?:{})\b", DENY_LIST.join("|")))
        .expect("deny-list pattern is valid");
}

/// Why a statement was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsafeReason {
    MissingSelect,
    DeniedKeyword(String),
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeReason::MissingSelect => write!(f, "statement does not contain SELECT"),
            UnsafeReason::DeniedKeyword(word) => {
                write!(f, "statement contains forbidden keyword {}", word)
            }
        }
    }
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Safe,
    Unsafe(UnsafeReason),
}

impl GateVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, GateVerdict::Safe)
    }
}

/// Remove `--` line comments and `/* ... */` block comments, then trim.
///
/// Block comments collapse to a single space and line comments stop before the
/// newline, so removing a comment never joins its neighbours into a new comment
/// marker. That keeps `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '-' && chars.peek() == Some(&'-') {
            while let Some(&next) = chars.peek() {
                if next == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }

        if ch == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = '\0';
            for next in chars.by_ref() {
                if prev == '*' && next == '/' {
                    break;
                }
                prev = next;
            }
            // Unterminated block comments swallow the rest of the input.
            out.push(' ');
            continue;
        }

        out.push(ch);
    }

    out.trim().to_string()
}

/// Screen an already sanitized statement.
pub fn classify(sql: &str) -> GateVerdict {
    if let Some(found) = DENIED_WORD.find(sql) {
        return GateVerdict::Unsafe(UnsafeReason::DeniedKeyword(
            found.as_str().to_ascii_uppercase(),
        ));
    }

    if !SELECT_WORD.is_match(sql) {
        return GateVerdict::Unsafe(UnsafeReason::MissingSelect);
    }

    GateVerdict::Safe
}

/// Sanitize then classify, returning the text that would be released.
pub fn screen(sql: &str) -> (String, GateVerdict) {
    let sanitized = sanitize(sql);
    let verdict = classify(&sanitized);
    (sanitized, verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_strips_line_comments() {
        assert_eq!(sanitize("SELECT 1 -- trailing note"), "SELECT 1");
        assert_eq!(
            sanitize("SELECT a -- first\nFROM t -- second"),
            "SELECT a \nFROM t"
        );
    }

    #[test]
    fn test_sanitize_strips_block_comments() {
        assert_eq!(sanitize("/* header */ SELECT 1"), "SELECT 1");
        assert_eq!(sanitize("SELECT /* a\nmulti-line */ 1"), "SELECT   1");
        assert_eq!(sanitize("SELECT 1 /* never closed"), "SELECT 1");
    }

    #[test]
    fn test_sanitize_does_not_fuse_comment_markers() {
        let once = sanitize("-/* gap */-DROP");
        assert_eq!(once, "- -DROP");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn test_classify_accepts_plain_select() {
        assert_eq!(classify("SELECT * FROM Employees"), GateVerdict::Safe);
        assert_eq!(classify("select id from t"), GateVerdict::Safe);
        assert_eq!(
            classify("WITH x AS (SELECT 1) SELECT * FROM x"),
            GateVerdict::Safe
        );
    }

    #[test]
    fn test_classify_rejects_denied_words_next_to_select() {
        assert_eq!(
            classify("DROP TABLE Employees; SELECT * FROM Employees"),
            GateVerdict::Unsafe(UnsafeReason::DeniedKeyword("DROP".to_string()))
        );
        assert_eq!(
            classify("select 1; exec xp_cmdshell 'dir'"),
            GateVerdict::Unsafe(UnsafeReason::DeniedKeyword("EXEC".to_string()))
        );
        assert_eq!(
            classify("SELECT * FROM t; sp_executesql N'x'"),
            GateVerdict::Unsafe(UnsafeReason::DeniedKeyword("SP_EXECUTESQL".to_string()))
        );
    }

    #[test]
    fn test_classify_matches_whole_words_only() {
        assert_eq!(
            classify("SELECT Dropped, Updated_At, CreatedBy FROM Deletions"),
            GateVerdict::Safe
        );
        assert_eq!(
            classify("SELECTED * FROM t"),
            GateVerdict::Unsafe(UnsafeReason::MissingSelect)
        );
    }

    #[test]
    fn test_classify_over_rejects_literals() {
        // Lexical screen: a banned word in a literal still rejects.
        assert!(!classify("SELECT * FROM t WHERE note = 'please delete me'").is_safe());
    }

    #[test]
    fn test_classify_requires_select() {
        assert_eq!(classify(""), GateVerdict::Unsafe(UnsafeReason::MissingSelect));
        assert_eq!(
            classify("SHOW TABLES"),
            GateVerdict::Unsafe(UnsafeReason::MissingSelect)
        );
    }

    #[test]
    fn test_screen_hides_commented_payload() {
        let (text, verdict) = screen("SELECT 1 -- ; DROP TABLE t");
        assert_eq!(text, "SELECT 1");
        assert!(verdict.is_safe());
    }

    fn denied_word() -> impl Strategy<Value = String> {
        prop::sample::select(DENY_LIST.to_vec()).prop_map(str::to_string)
    }

    fn mixed_case(word: String, mask: Vec<bool>) -> String {
        word.chars()
            .zip(mask.into_iter().chain(std::iter::repeat(false)))
            .map(|(c, lower)| if lower { c.to_ascii_lowercase() } else { c })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(input in ".{0,200}") {
            let once = sanitize(&input);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn prop_sanitize_is_idempotent_on_comment_soup(
            input in proptest::collection::vec(
                prop::sample::select(vec!["-", "/", "*", "\n", " ", "SELECT", "x", "'"]),
                0..60,
            )
        ) {
            let input = input.concat();
            let once = sanitize(&input);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn prop_denied_word_always_rejects(
            word in denied_word(),
            mask in proptest::collection::vec(any::<bool>(), 16),
            table in "[a-z]{1,12}",
        ) {
            let sql = format!("SELECT * FROM {}; {} {}", table, mixed_case(word, mask), table);
            prop_assert!(matches!(classify(&sql), GateVerdict::Unsafe(UnsafeReason::DeniedKeyword(_))));
        }

        #[test]
        fn prop_select_without_denied_word_is_safe(
            columns in proptest::collection::vec("[a-z]{1,8}", 1..5),
            table in "[a-z]{1,12}",
        ) {
            let sql = format!("SELECT {} FROM t_{}", columns.join(", "), table);
            prop_assume!(!DENY_LIST.iter().any(|w| columns.iter().any(|c| c.eq_ignore_ascii_case(w))));
            prop_assert_eq!(classify(&sql), GateVerdict::Safe);
        }
    }
}
