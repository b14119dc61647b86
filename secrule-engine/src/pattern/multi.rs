//! Multi-pattern (set matching) back-end.
//!
//! Used by the `pm` / `pmFromFile` / `ipMatchFromFile` operator family and by
//! `@file@` sub-name selectors. Literal pattern sets compile straight into an
//! Aho-Corasick automaton. Non-literal sets (files that toggle `##!+ -l`)
//! keep a per-pattern regex and use an automaton over extracted literal
//! fragments as a prefilter; every prefilter hit is confirmed by re-scanning
//! a bounded window around the hit with the exact pattern.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::pattern::Pattern;

/// Confirmation window bounds around a prefilter hit.
const CONFIRM_BEFORE: usize = 512;
const CONFIRM_AFTER: usize = 256;

/// One pattern of a set, after file preprocessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    pub text: String,
    pub case_insensitive: bool,
}

/// A parsed (not yet compiled) pattern set.
///
/// The file format, one pattern per line:
/// - `##` terminates the file;
/// - `#` starts a line comment;
/// - `##!^ P` / `##!$ S` install a running prefix/suffix applied to the
///   patterns that follow;
/// - `##!+ i` / `##!+ -i` toggle case-insensitivity for what follows
///   (default: insensitive);
/// - `##!+ l` / `##!+ -l` toggle literal mode for the whole file
///   (default: literal).
#[derive(Debug, Clone, Default)]
pub struct MultiPatternSet {
    pub patterns: Vec<PatternSpec>,
    pub literal: bool,
}

impl MultiPatternSet {
    /// Parse the pattern file format.
    pub fn parse(text: &str) -> Self {
        let mut set = MultiPatternSet {
            patterns: Vec::new(),
            literal: true,
        };
        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut case_insensitive = true;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line == "##" {
                break;
            }
            if let Some(rest) = line.strip_prefix("##!^ ") {
                prefix = rest.to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("##!$ ") {
                suffix = rest.to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("##!+ ") {
                match rest.trim() {
                    "i" => case_insensitive = true,
                    "-i" => case_insensitive = false,
                    "l" => set.literal = true,
                    "-l" => set.literal = false,
                    other => warn!(directive = other, "Unknown pattern file directive"),
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            set.patterns.push(PatternSpec {
                text: format!("{prefix}{line}{suffix}"),
                case_insensitive,
            });
        }

        set
    }

    /// Build a set from inline phrases (the `pm` operator: case-insensitive
    /// literal keywords).
    pub fn from_phrases<I: IntoIterator<Item = S>, S: Into<String>>(phrases: I) -> Self {
        MultiPatternSet {
            patterns: phrases
                .into_iter()
                .map(|p| PatternSpec {
                    text: p.into(),
                    case_insensitive: true,
                })
                .collect(),
            literal: true,
        }
    }

    /// Compile the set.
    pub fn compile(&self, step_limit: u32) -> Result<MultiPattern> {
        if self.patterns.is_empty() {
            return Err(EngineError::Pattern(
                "empty multi-pattern set".to_string(),
            ));
        }
        if self.literal {
            MultiPattern::compile_literal(&self.patterns)
        } else {
            MultiPattern::compile_filtered(&self.patterns, step_limit)
        }
    }

    /// Content hash used to key serialised databases.
    pub fn sha1(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update([self.literal as u8]);
        for p in &self.patterns {
            hasher.update([p.case_insensitive as u8]);
            hasher.update(p.text.as_bytes());
            hasher.update([0u8]);
        }
        hex_string(&hasher.finalize())
    }
}

/// A compiled multi-pattern matcher.
#[derive(Debug)]
pub enum MultiPattern {
    /// Pure literal set: one automaton per case-sensitivity class.
    Literal {
        insensitive: Option<AhoCorasick>,
        sensitive: Option<AhoCorasick>,
    },
    /// Regex set behind a literal-fragment prefilter.
    Filtered {
        /// Automaton over extracted fragments; value maps to a pattern index.
        prefilter: Option<AhoCorasick>,
        fragment_owner: Vec<usize>,
        patterns: Vec<Arc<Pattern>>,
        /// Patterns with no extractable fragment, scanned on every subject.
        unfiltered: Vec<usize>,
    },
}

impl MultiPattern {
    fn compile_literal(specs: &[PatternSpec]) -> Result<MultiPattern> {
        let insensitive: Vec<&str> = specs
            .iter()
            .filter(|s| s.case_insensitive)
            .map(|s| s.text.as_str())
            .collect();
        let sensitive: Vec<&str> = specs
            .iter()
            .filter(|s| !s.case_insensitive)
            .map(|s| s.text.as_str())
            .collect();

        let build = |patterns: &[&str], ci: bool| -> Result<Option<AhoCorasick>> {
            if patterns.is_empty() {
                return Ok(None);
            }
            AhoCorasick::builder()
                .ascii_case_insensitive(ci)
                .build(patterns)
                .map(Some)
                .map_err(|e| EngineError::Pattern(format!("failed to build automaton: {e}")))
        };

        Ok(MultiPattern::Literal {
            insensitive: build(&insensitive, true)?,
            sensitive: build(&sensitive, false)?,
        })
    }

    fn compile_filtered(specs: &[PatternSpec], step_limit: u32) -> Result<MultiPattern> {
        let mut patterns = Vec::with_capacity(specs.len());
        let mut fragments = Vec::new();
        let mut fragment_owner = Vec::new();
        let mut unfiltered = Vec::new();

        for (index, spec) in specs.iter().enumerate() {
            patterns.push(crate::pattern::intern(
                &spec.text,
                spec.case_insensitive,
                step_limit,
            )?);
            match literal_fragment(&spec.text) {
                Some(fragment) => {
                    fragments.push(fragment.to_ascii_lowercase());
                    fragment_owner.push(index);
                }
                None => unfiltered.push(index),
            }
        }

        let prefilter = if fragments.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&fragments)
                    .map_err(|e| {
                        EngineError::Pattern(format!("failed to build prefilter: {e}"))
                    })?,
            )
        };

        Ok(MultiPattern::Filtered {
            prefilter,
            fragment_owner,
            patterns,
            unfiltered,
        })
    }

    /// First match span `(from, to)`, if any.
    pub fn find(&self, subject: &str) -> Option<(usize, usize)> {
        match self {
            MultiPattern::Literal {
                insensitive,
                sensitive,
            } => {
                let a = insensitive
                    .as_ref()
                    .and_then(|ac| ac.find(subject))
                    .map(|m| (m.start(), m.end()));
                let b = sensitive
                    .as_ref()
                    .and_then(|ac| ac.find(subject))
                    .map(|m| (m.start(), m.end()));
                match (a, b) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            MultiPattern::Filtered {
                prefilter,
                fragment_owner,
                patterns,
                unfiltered,
            } => {
                let mut confirmed: Option<(usize, usize)> = None;
                let mut seen: HashSet<(usize, usize)> = HashSet::new();

                if let Some(ac) = prefilter {
                    for hit in ac.find_iter(subject) {
                        let owner = fragment_owner[hit.pattern().as_usize()];
                        let window_start = floor_char_boundary(subject, hit.start().saturating_sub(CONFIRM_BEFORE));
                        let window_end =
                            ceil_char_boundary(subject, (hit.end() + CONFIRM_AFTER).min(subject.len()));
                        let window = &subject[window_start..window_end];
                        if let Some(caps) = patterns[owner].captures(window) {
                            let (from, to) = caps[0];
                            let span = (window_start + from, window_start + to);
                            if seen.insert((owner, span.1)) {
                                confirmed = Some(match confirmed {
                                    Some(best) => best.min(span),
                                    None => span,
                                });
                            }
                        }
                    }
                }

                for &index in unfiltered {
                    if let Some(caps) = patterns[index].captures(subject) {
                        let span = caps[0];
                        confirmed = Some(match confirmed {
                            Some(best) => best.min(span),
                            None => span,
                        });
                    }
                }

                confirmed
            }
        }
    }

    pub fn matches(&self, subject: &str) -> bool {
        self.find(subject).is_some()
    }
}

/// Extract the longest metacharacter-free fragment of a regex usable as a
/// prefilter key. Fragments shorter than three bytes filter nothing.
fn literal_fragment(pattern: &str) -> Option<&str> {
    pattern
        .split(|c: char| !c.is_ascii() || crate::pattern::REGEX_META.contains(&(c as u8)))
        .max_by_key(|fragment| fragment.len())
        .filter(|fragment| fragment.len() >= 3)
}

/// Process-wide cache of file-backed databases, keyed by absolute path.
static FILE_CACHE: Lazy<DashMap<PathBuf, Arc<MultiPattern>>> = Lazy::new(DashMap::new);

/// Load and compile a pattern file through the process-wide cache. When
/// `serialize_dir` is set, the preprocessed pattern list is cached there
/// keyed by content hash so repeated loads skip the file-format pass.
pub fn intern_file(path: &Path, serialize_dir: &str, step_limit: u32) -> Result<Arc<MultiPattern>> {
    let canonical = path
        .canonicalize()
        .map_err(|e| EngineError::Pattern(format!("cannot resolve {}: {e}", path.display())))?;
    if let Some(found) = FILE_CACHE.get(&canonical) {
        return Ok(found.clone());
    }

    let text = std::fs::read_to_string(&canonical)?;
    let set = load_set(&text, serialize_dir);
    let compiled = Arc::new(set.compile(step_limit)?);
    debug!(path = %canonical.display(), patterns = set.patterns.len(), "Compiled pattern file");
    FILE_CACHE.insert(canonical, compiled.clone());
    Ok(compiled)
}

fn load_set(text: &str, serialize_dir: &str) -> MultiPatternSet {
    if serialize_dir.is_empty() {
        return MultiPatternSet::parse(text);
    }

    // The serialised form is the expanded list (prefixes/suffixes applied,
    // per-pattern flags resolved), keyed by a hash of the raw source.
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    let cache_path = Path::new(serialize_dir).join(format!("{}.pmf", hex_string(&hasher.finalize())));

    if let Ok(serialized) = std::fs::read_to_string(&cache_path) {
        if let Some(set) = deserialize_set(&serialized) {
            return set;
        }
    }

    let set = MultiPatternSet::parse(text);
    if let Err(e) = std::fs::write(&cache_path, serialize_set(&set)) {
        warn!(path = %cache_path.display(), error = %e, "Failed to serialise pattern database");
    }
    set
}

fn serialize_set(set: &MultiPatternSet) -> String {
    let mut out = String::new();
    out.push_str(if set.literal { "l\n" } else { "-l\n" });
    for p in &set.patterns {
        out.push(if p.case_insensitive { 'i' } else { 's' });
        out.push(' ');
        out.push_str(&p.text);
        out.push('\n');
    }
    out
}

fn deserialize_set(text: &str) -> Option<MultiPatternSet> {
    let mut lines = text.lines();
    let literal = match lines.next()? {
        "l" => true,
        "-l" => false,
        _ => return None,
    };
    let mut patterns = Vec::new();
    for line in lines {
        let (flag, text) = line.split_at(line.char_indices().nth(2)?.0);
        patterns.push(PatternSpec {
            text: text.to_string(),
            case_insensitive: flag.starts_with('i'),
        });
    }
    Some(MultiPatternSet { patterns, literal })
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_format_basics() {
        let set = MultiPatternSet::parse("# comment\nfoo\nbar\n##\nnever-seen\n");
        assert_eq!(set.patterns.len(), 2);
        assert_eq!(set.patterns[0].text, "foo");
        assert!(set.patterns[0].case_insensitive);
        assert!(set.literal);
    }

    #[test]
    fn test_file_format_prefix_suffix() {
        let set = MultiPatternSet::parse("##!^ pre-\n##!$ -post\nmid\nother\n");
        assert_eq!(set.patterns[0].text, "pre-mid-post");
        assert_eq!(set.patterns[1].text, "pre-other-post");
    }

    #[test]
    fn test_file_format_case_toggle() {
        let set = MultiPatternSet::parse("always\n##!+ -i\nExact\n##!+ i\nagain\n");
        assert!(set.patterns[0].case_insensitive);
        assert!(!set.patterns[1].case_insensitive);
        assert!(set.patterns[2].case_insensitive);
    }

    #[test]
    fn test_literal_matching() {
        let set = MultiPatternSet::from_phrases(["attack", "exploit"]);
        let compiled = set.compile(0).unwrap();
        assert_eq!(compiled.find("an ATTACK here"), Some((3, 9)));
        assert!(!compiled.matches("benign"));
    }

    #[test]
    fn test_mixed_case_classes() {
        let set = MultiPatternSet::parse("soft\n##!+ -i\nHARD\n");
        let compiled = set.compile(0).unwrap();
        assert!(compiled.matches("SOFT"));
        assert!(compiled.matches("xHARDx"));
        assert!(!compiled.matches("hard"));
    }

    #[test]
    fn test_filtered_mode_confirms_hits() {
        let set = MultiPatternSet::parse("##!+ -l\nunion\\s+select\n");
        let compiled = set.compile(0).unwrap();
        assert!(compiled.matches("1 UNION  SELECT 2"));
        assert!(!compiled.matches("union without the verb"));
    }

    #[test]
    fn test_serialise_round_trip() {
        let set = MultiPatternSet::parse("##!+ -i\nkeep\n##!+ i\nboth\n");
        let restored = deserialize_set(&serialize_set(&set)).unwrap();
        assert_eq!(restored.patterns, set.patterns);
        assert_eq!(restored.literal, set.literal);
    }
}
