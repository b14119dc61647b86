//! Heuristic attack detectors backing `@detectSqli` and `@detectXSS`.
//!
//! Pattern families are compiled once per process through the shared pattern
//! cache and scanned in order; the first hit wins and its span is staged as
//! TX:0.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::pattern::{intern, Pattern};

const SQLI_PATTERNS: &[&str] = &[
    r"(?i)(union\s+select)",
    r"(?i)(select\s+.*\s+from)",
    r"(?i)(insert\s+into)",
    r"(?i)(delete\s+from)",
    r"(?i)(drop\s+table)",
    r"(?i)('\s*or\s+\d+\s*=\s*\d+)",
    r"(?i)(or\s+1\s*=\s*1)",
    r"(?i)(and\s+1\s*=\s*1)",
    r"(?i)(exec\s*\()",
    r"(?i)(sp_executesql)",
    r"(?i)(xp_cmdshell)",
    r"(?i)(benchmark\s*\()",
    r"(?i)(sleep\s*\()",
    r"(?i)(waitfor\s+delay)",
];

const XSS_PATTERNS: &[&str] = &[
    r"(?i)<script[^>]*>",
    r"(?i)</script>",
    r"(?i)<iframe[^>]*>",
    r"(?i)<object[^>]*>",
    r"(?i)<embed[^>]*>",
    r"(?i)<form[^>]*>",
    r"(?i)javascript:",
    r"(?i)vbscript:",
    r"(?i)onload\s*=",
    r"(?i)onerror\s*=",
    r"(?i)onclick\s*=",
    r"(?i)onmouseover\s*=",
    r"(?i)onfocus\s*=",
    r"(?i)onblur\s*=",
    r"(?i)onchange\s*=",
    r"(?i)onsubmit\s*=",
    r"(?i)expression\s*\(",
    r"(?i)url\s*\(",
    r"(?i)@import",
    r"(?i)<img[^>]*src\s*=\s*['\x22]?javascript:",
];

fn compile_family(patterns: &[&str]) -> Vec<Arc<Pattern>> {
    patterns
        .iter()
        .filter_map(|p| match intern(p, false, 0) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!(pattern = p, error = %e, "Failed to compile detector pattern");
                None
            }
        })
        .collect()
}

static SQLI: Lazy<Vec<Arc<Pattern>>> = Lazy::new(|| compile_family(SQLI_PATTERNS));
static XSS: Lazy<Vec<Arc<Pattern>>> = Lazy::new(|| compile_family(XSS_PATTERNS));

fn scan(family: &[Arc<Pattern>], subject: &str) -> Option<(usize, usize)> {
    family
        .iter()
        .filter_map(|p| p.captures(subject).map(|caps| caps[0]))
        .min()
}

/// SQL-injection heuristic. Returns the matched span on detection.
pub fn detect_sqli(subject: &str) -> Option<(usize, usize)> {
    scan(&SQLI, subject)
}

/// Cross-site-scripting heuristic. Returns the matched span on detection.
pub fn detect_xss(subject: &str) -> Option<(usize, usize)> {
    scan(&XSS, subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqli_detection() {
        assert!(detect_sqli("1 UNION SELECT password FROM users").is_some());
        assert!(detect_sqli("' or 1=1").is_some());
        assert!(detect_sqli("ordinary search text").is_none());
    }

    #[test]
    fn test_xss_detection() {
        assert!(detect_xss("<script>alert(1)</script>").is_some());
        assert!(detect_xss("<img src=javascript:alert(1)>").is_some());
        assert!(detect_xss("plain <b>bold</b> text").is_none());
    }

    #[test]
    fn test_first_span_wins() {
        let span = detect_sqli("xx union select yy").unwrap();
        assert_eq!(span.0, 3);
    }
}
