//! Pattern matching back-ends.
//!
//! Three back-ends sit behind one compiled-pattern type: a literal searcher
//! for patterns without regex metacharacters, a finite-automaton regex for
//! everything the `regex` crate accepts, and a backtracking fallback for the
//! constructs it rejects (look-around, back-references). Selection happens
//! once at compile time from the pattern text; compiled patterns are interned
//! process-wide and shared across rules.

mod multi;

pub use multi::{intern_file, MultiPattern, MultiPatternSet};

use std::sync::Arc;

use dashmap::DashMap;
use memchr::memmem;
use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Characters that force a pattern onto a regex back-end.
pub(crate) const REGEX_META: &[u8] = br".^$*+?()[]{}|\";

/// Returns true when `pattern` contains no regex metacharacters and can be
/// matched with a plain substring search.
pub fn is_literal_pattern(pattern: &str) -> bool {
    !pattern.bytes().any(|b| REGEX_META.contains(&b))
}

/// A compiled single-pattern matcher. Immutable and `Send + Sync`; scan
/// scratch is thread-local inside the regex engines.
#[derive(Debug)]
pub enum Pattern {
    /// Substring search (memmem). Case-insensitive variants store the needle
    /// lower-cased and fold the subject at scan time.
    Literal {
        finder: memmem::Finder<'static>,
        case_insensitive: bool,
        len: usize,
    },
    /// Finite-automaton regex: leftmost-first, no backtracking.
    Automaton(regex::Regex),
    /// Backtracking fallback with a configurable step limit.
    Backtrack(fancy_regex::Regex),
}

impl Pattern {
    /// Compile `pattern`, choosing the cheapest capable back-end.
    pub fn compile(pattern: &str, case_insensitive: bool, step_limit: u32) -> Result<Self> {
        if is_literal_pattern(pattern) {
            let needle = if case_insensitive {
                pattern.to_ascii_lowercase()
            } else {
                pattern.to_string()
            };
            return Ok(Pattern::Literal {
                len: needle.len(),
                finder: memmem::Finder::new(needle.as_bytes()).into_owned(),
                case_insensitive,
            });
        }

        match regex::RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(re) => Ok(Pattern::Automaton(re)),
            Err(automaton_err) => {
                let source = if case_insensitive {
                    format!("(?i){pattern}")
                } else {
                    pattern.to_string()
                };
                let mut builder = fancy_regex::RegexBuilder::new(&source);
                if step_limit > 0 {
                    builder.backtrack_limit(step_limit as usize);
                }
                match builder.build() {
                    Ok(re) => {
                        warn!(
                            pattern = pattern,
                            error = %automaton_err,
                            "Pattern rejected by the finite-automaton engine, using backtracking back-end"
                        );
                        Ok(Pattern::Backtrack(re))
                    }
                    Err(e) => Err(EngineError::Pattern(format!(
                        "failed to compile pattern '{pattern}': {e}"
                    ))),
                }
            }
        }
    }

    /// Predicate interface: does `subject` contain a match.
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            Pattern::Literal {
                finder,
                case_insensitive,
                ..
            } => {
                if *case_insensitive {
                    finder.find(subject.to_ascii_lowercase().as_bytes()).is_some()
                } else {
                    finder.find(subject.as_bytes()).is_some()
                }
            }
            Pattern::Automaton(re) => re.is_match(subject),
            Pattern::Backtrack(re) => match re.is_match(subject) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(error = %e, "Backtracking scan failed, treating as no-match");
                    false
                }
            },
        }
    }

    /// First match with capture-group spans. Group 0 comes first; absent
    /// groups are skipped. Returns `None` on no-match.
    pub fn captures(&self, subject: &str) -> Option<Vec<(usize, usize)>> {
        match self {
            Pattern::Literal {
                finder,
                case_insensitive,
                len,
            } => {
                let from = if *case_insensitive {
                    finder.find(subject.to_ascii_lowercase().as_bytes())?
                } else {
                    finder.find(subject.as_bytes())?
                };
                Some(vec![(from, from + len)])
            }
            Pattern::Automaton(re) => {
                let caps = re.captures(subject)?;
                Some(
                    caps.iter()
                        .flatten()
                        .map(|m| (m.start(), m.end()))
                        .collect(),
                )
            }
            Pattern::Backtrack(re) => {
                let caps = match re.captures(subject) {
                    Ok(caps) => caps?,
                    Err(e) => {
                        warn!(error = %e, "Backtracking scan failed, treating as no-match");
                        return None;
                    }
                };
                Some(
                    caps.iter()
                        .flatten()
                        .map(|m| (m.start(), m.end()))
                        .collect(),
                )
            }
        }
    }

    /// Richer scan interface: all non-overlapping `(from, to)` match spans.
    pub fn scan(&self, subject: &str) -> Vec<(usize, usize)> {
        match self {
            Pattern::Literal {
                finder,
                case_insensitive,
                len,
            } => {
                let haystack: std::borrow::Cow<'_, [u8]> = if *case_insensitive {
                    subject.to_ascii_lowercase().into_bytes().into()
                } else {
                    subject.as_bytes().into()
                };
                finder
                    .find_iter(&haystack)
                    .map(|from| (from, from + len))
                    .collect()
            }
            Pattern::Automaton(re) => re
                .find_iter(subject)
                .map(|m| (m.start(), m.end()))
                .collect(),
            Pattern::Backtrack(re) => {
                let mut spans = Vec::new();
                for m in re.find_iter(subject) {
                    match m {
                        Ok(m) => spans.push((m.start(), m.end())),
                        Err(e) => {
                            warn!(error = %e, "Backtracking scan failed, truncating results");
                            break;
                        }
                    }
                }
                spans
            }
        }
    }
}

/// Process-wide compiled pattern cache, keyed by `(flags, pattern-text)`.
/// Populated during compile; the map stays lock-guarded only for patterns
/// created lazily from macro expansions at request time.
static PATTERN_CACHE: Lazy<DashMap<String, Arc<Pattern>>> = Lazy::new(DashMap::new);

/// Compile through the process-wide intern cache.
pub fn intern(pattern: &str, case_insensitive: bool, step_limit: u32) -> Result<Arc<Pattern>> {
    let key = format!("{}:{}:{}", case_insensitive as u8, step_limit, pattern);
    if let Some(found) = PATTERN_CACHE.get(&key) {
        return Ok(found.clone());
    }
    let compiled = Arc::new(Pattern::compile(pattern, case_insensitive, step_limit)?);
    PATTERN_CACHE.insert(key, compiled.clone());
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_detection() {
        assert!(is_literal_pattern("evil"));
        assert!(is_literal_pattern("union select"));
        assert!(!is_literal_pattern("a.b"));
        assert!(!is_literal_pattern("^(foo)$"));
    }

    #[test]
    fn test_literal_backend() {
        let p = Pattern::compile("needle", false, 0).unwrap();
        assert!(matches!(p, Pattern::Literal { .. }));
        assert!(p.matches("haystack with a needle inside"));
        assert!(!p.matches("nothing here"));
        assert_eq!(p.scan("needle needle"), vec![(0, 6), (7, 13)]);
    }

    #[test]
    fn test_case_insensitive_literal() {
        let p = Pattern::compile("Needle", true, 0).unwrap();
        assert!(p.matches("A NEEDLE"));
        assert!(p.matches("a needle"));
    }

    #[test]
    fn test_automaton_backend() {
        let p = Pattern::compile("^(foo)(bar)$", false, 0).unwrap();
        assert!(matches!(p, Pattern::Automaton(_)));
        let caps = p.captures("foobar").unwrap();
        assert_eq!(caps, vec![(0, 6), (0, 3), (3, 6)]);
        assert!(p.captures("foobarx").is_none());
    }

    #[test]
    fn test_backtracking_fallback() {
        // Look-behind is not expressible as a finite automaton.
        let p = Pattern::compile(r"(?<=hello)world", false, 0).unwrap();
        assert!(matches!(p, Pattern::Backtrack(_)));
        assert!(p.matches("helloworld"));
        assert!(!p.matches("world"));
    }

    #[test]
    fn test_literal_and_automaton_agree() {
        // Property 5 of the specification: on metacharacter-free patterns the
        // two back-ends produce identical span sequences.
        let subjects = ["abcabc", "xabcx", "", "abc", "aabbcc"];
        for needle in ["abc", "b", "cab"] {
            let lit = Pattern::compile(needle, false, 0).unwrap();
            let auto = Pattern::Automaton(regex::Regex::new(needle).unwrap());
            for subject in subjects {
                assert_eq!(lit.scan(subject), auto.scan(subject), "needle={needle}");
            }
        }
    }

    #[test]
    fn test_interning_shares_compilations() {
        let a = intern("shared-pattern", false, 0).unwrap();
        let b = intern("shared-pattern", false, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = intern("shared-pattern", true, 0).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
