//! Operator nodes: predicates over a single transformed value.
//!
//! An operator may stage up to ten captures (TX:0..TX:9) while evaluating;
//! the staging area is merged into the transaction only when the rule records
//! the matched variable, and cleared on no-match.

mod detect;

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use memchr::memmem;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::expansion::Expansion;
use crate::pattern::{self, MultiPattern, MultiPatternSet, Pattern};
use crate::rule::Rule;
use crate::transaction::Transaction;
use crate::variant::Variant;

/// Compile-time context handed to operator construction.
#[derive(Debug, Clone)]
pub struct OperatorCtx {
    /// Directory of the rule file being parsed; `@file@`-style operands
    /// resolve relative to it.
    pub rule_dir: std::path::PathBuf,
    /// SecPmfSerializeDir
    pub pmf_serialize_dir: String,
    /// SecPcreMatchLimit
    pub step_limit: u32,
}

/// The closed operator set with per-kind compiled payloads.
#[derive(Debug)]
pub enum OperatorKind {
    /// `@rx` — the default operator. `pattern` is `None` when the operand is
    /// a macro; the compiled form is then cached per expanded value.
    Rx { pattern: Option<Arc<Pattern>> },
    /// `@rxGlobal` — all matches, each staging captures.
    RxGlobal { pattern: Option<Arc<Pattern>> },
    BeginsWith,
    EndsWith,
    Contains,
    ContainsWord,
    Within,
    Streq,
    Strmatch { finder: memmem::Finder<'static> },
    Pm { set: Arc<MultiPattern> },
    PmFromFile { set: Arc<MultiPattern> },
    IpMatch { nets: Vec<IpNet> },
    IpMatchFromFile { nets: Vec<IpNet> },
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    DetectSqli,
    DetectXss,
    UnconditionalMatch,
    NoMatch,
    ValidateByteRange { allowed: Box<[bool; 256]> },
    ValidateDtd,
    ValidateSchema,
    ValidateUrlEncoding,
    ValidateUtf8Encoding,
    VerifyCc { pattern: Arc<Pattern> },
    VerifyCpf { pattern: Arc<Pattern> },
    VerifySsn { pattern: Arc<Pattern> },
    Rsub { pattern: Arc<Pattern> },
    GeoLookup,
    InspectFile,
    FuzzyHash,
    Xor,
    Rbl,
}

/// A compiled operator node.
#[derive(Debug)]
pub struct Operator {
    pub kind: OperatorKind,
    pub is_not: bool,
    /// Enabled by the `capture` action; gates regex group staging.
    pub capture: bool,
    literal: String,
    macro_operand: Option<Expansion>,
    step_limit: u32,
}

impl Operator {
    /// Build an operator from its rule-language name and operand.
    pub fn new(name: &str, operand: &str, is_not: bool, ctx: &OperatorCtx) -> Result<Operator> {
        let has_macro = Expansion::contains_macro(operand);
        let macro_operand = has_macro.then(|| Expansion::parse(operand));

        let rx_pattern = |sl: u32| -> Result<Option<Arc<Pattern>>> {
            if has_macro {
                Ok(None)
            } else {
                pattern::intern(operand, false, sl).map(Some)
            }
        };

        let kind = match name {
            "rx" => OperatorKind::Rx {
                pattern: rx_pattern(ctx.step_limit)?,
            },
            "rxGlobal" => OperatorKind::RxGlobal {
                pattern: rx_pattern(ctx.step_limit)?,
            },
            "beginsWith" => OperatorKind::BeginsWith,
            "endsWith" => OperatorKind::EndsWith,
            "contains" => OperatorKind::Contains,
            "containsWord" => OperatorKind::ContainsWord,
            "within" => OperatorKind::Within,
            "streq" => OperatorKind::Streq,
            "strmatch" => OperatorKind::Strmatch {
                finder: memmem::Finder::new(operand.as_bytes()).into_owned(),
            },
            "pm" => OperatorKind::Pm {
                set: Arc::new(
                    MultiPatternSet::from_phrases(operand.split_whitespace())
                        .compile(ctx.step_limit)?,
                ),
            },
            "pmFromFile" | "pmf" => OperatorKind::PmFromFile {
                set: pattern::intern_file(
                    &resolve_path(&ctx.rule_dir, operand),
                    &ctx.pmf_serialize_dir,
                    ctx.step_limit,
                )?,
            },
            "ipMatch" => OperatorKind::IpMatch {
                nets: parse_ip_list(operand)?,
            },
            "ipMatchFromFile" | "ipMatchF" => {
                let path = resolve_path(&ctx.rule_dir, operand);
                let text = std::fs::read_to_string(&path)?;
                let joined: Vec<&str> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .collect();
                OperatorKind::IpMatchFromFile {
                    nets: parse_ip_list(&joined.join(","))?,
                }
            }
            "eq" => OperatorKind::Eq,
            "ge" => OperatorKind::Ge,
            "gt" => OperatorKind::Gt,
            "le" => OperatorKind::Le,
            "lt" => OperatorKind::Lt,
            "detectSQLi" | "detectSqli" => OperatorKind::DetectSqli,
            "detectXSS" => OperatorKind::DetectXss,
            "unconditionalMatch" => OperatorKind::UnconditionalMatch,
            "noMatch" => OperatorKind::NoMatch,
            "validateByteRange" => OperatorKind::ValidateByteRange {
                allowed: parse_byte_ranges(operand)?,
            },
            "validateDTD" | "validateDtd" => OperatorKind::ValidateDtd,
            "validateSchema" => OperatorKind::ValidateSchema,
            "validateUrlEncoding" => OperatorKind::ValidateUrlEncoding,
            "validateUtf8Encoding" => OperatorKind::ValidateUtf8Encoding,
            "verifyCC" => OperatorKind::VerifyCc {
                pattern: verify_pattern(operand, r"\d{13,19}", ctx.step_limit)?,
            },
            "verifyCPF" => OperatorKind::VerifyCpf {
                pattern: verify_pattern(operand, r"\d{3}\.?\d{3}\.?\d{3}-?\d{2}", ctx.step_limit)?,
            },
            "verifySSN" => OperatorKind::VerifySsn {
                pattern: verify_pattern(operand, r"\d{3}-?\d{2}-?\d{4}", ctx.step_limit)?,
            },
            "rsub" => {
                let (pattern_text, _) = parse_rsub(operand)?;
                OperatorKind::Rsub {
                    pattern: pattern::intern(&pattern_text, false, ctx.step_limit)?,
                }
            }
            "geoLookup" => OperatorKind::GeoLookup,
            "inspectFile" => OperatorKind::InspectFile,
            "fuzzyHash" => OperatorKind::FuzzyHash,
            "xor" => OperatorKind::Xor,
            "rbl" => OperatorKind::Rbl,
            other => {
                return Err(EngineError::Parse(format!("unknown operator '@{other}'")));
            }
        };

        Ok(Operator {
            kind,
            is_not,
            capture: false,
            literal: operand.to_string(),
            macro_operand,
            step_limit: ctx.step_limit,
        })
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            OperatorKind::Rx { .. } => "rx",
            OperatorKind::RxGlobal { .. } => "rxGlobal",
            OperatorKind::BeginsWith => "beginsWith",
            OperatorKind::EndsWith => "endsWith",
            OperatorKind::Contains => "contains",
            OperatorKind::ContainsWord => "containsWord",
            OperatorKind::Within => "within",
            OperatorKind::Streq => "streq",
            OperatorKind::Strmatch { .. } => "strmatch",
            OperatorKind::Pm { .. } => "pm",
            OperatorKind::PmFromFile { .. } => "pmFromFile",
            OperatorKind::IpMatch { .. } => "ipMatch",
            OperatorKind::IpMatchFromFile { .. } => "ipMatchFromFile",
            OperatorKind::Eq => "eq",
            OperatorKind::Ge => "ge",
            OperatorKind::Gt => "gt",
            OperatorKind::Le => "le",
            OperatorKind::Lt => "lt",
            OperatorKind::DetectSqli => "detectSQLi",
            OperatorKind::DetectXss => "detectXSS",
            OperatorKind::UnconditionalMatch => "unconditionalMatch",
            OperatorKind::NoMatch => "noMatch",
            OperatorKind::ValidateByteRange { .. } => "validateByteRange",
            OperatorKind::ValidateDtd => "validateDTD",
            OperatorKind::ValidateSchema => "validateSchema",
            OperatorKind::ValidateUrlEncoding => "validateUrlEncoding",
            OperatorKind::ValidateUtf8Encoding => "validateUtf8Encoding",
            OperatorKind::VerifyCc { .. } => "verifyCC",
            OperatorKind::VerifyCpf { .. } => "verifyCPF",
            OperatorKind::VerifySsn { .. } => "verifySSN",
            OperatorKind::Rsub { .. } => "rsub",
            OperatorKind::GeoLookup => "geoLookup",
            OperatorKind::InspectFile => "inspectFile",
            OperatorKind::FuzzyHash => "fuzzyHash",
            OperatorKind::Xor => "xor",
            OperatorKind::Rbl => "rbl",
        }
    }

    pub fn literal_value(&self) -> &str {
        &self.literal
    }

    /// Evaluate the predicate. Does not apply `is_not` — negation is folded
    /// in by the rule so that chained bookkeeping sees the raw outcome.
    pub fn evaluate(&self, txn: &mut Transaction<'_>, operand: &Variant, rule: &Rule) -> bool {
        let expanded = self
            .macro_operand
            .as_ref()
            .map(|m| m.expand(txn, rule));
        let rhs: &str = expanded.as_deref().unwrap_or(&self.literal);

        match &self.kind {
            OperatorKind::Rx { pattern } => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                let subject = subject.to_string();
                match self.resolve_pattern(pattern, rhs) {
                    Some(p) => self.rx_match(txn, &p, &subject, false),
                    None => false,
                }
            }
            OperatorKind::RxGlobal { pattern } => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                let subject = subject.to_string();
                match self.resolve_pattern(pattern, rhs) {
                    Some(p) => self.rx_match(txn, &p, &subject, true),
                    None => false,
                }
            }
            OperatorKind::BeginsWith => {
                operand.as_str().is_some_and(|s| s.starts_with(rhs))
            }
            OperatorKind::EndsWith => operand.as_str().is_some_and(|s| s.ends_with(rhs)),
            OperatorKind::Contains => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                match subject.find(rhs) {
                    Some(from) => {
                        txn.stage_capture(0, Variant::from(&subject[from..from + rhs.len()]));
                        true
                    }
                    None => false,
                }
            }
            OperatorKind::ContainsWord => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                contains_word(subject, rhs)
            }
            OperatorKind::Within => operand
                .as_str()
                .is_some_and(|s| !s.is_empty() && rhs.contains(s)),
            OperatorKind::Streq => operand.as_str().is_some_and(|s| s == rhs),
            OperatorKind::Strmatch { finder } => operand
                .as_str()
                .is_some_and(|s| finder.find(s.as_bytes()).is_some()),
            OperatorKind::Pm { set } | OperatorKind::PmFromFile { set } => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                match set.find(subject) {
                    Some((from, to)) => {
                        txn.stage_capture(0, Variant::from(&subject[from..to]));
                        true
                    }
                    None => false,
                }
            }
            OperatorKind::IpMatch { nets } | OperatorKind::IpMatchFromFile { nets } => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                match IpAddr::from_str(subject.trim()) {
                    Ok(addr) => nets.iter().any(|net| net.contains(&addr)),
                    Err(_) => false,
                }
            }
            OperatorKind::Eq => operand.to_int_lossy() == rhs_int(rhs),
            OperatorKind::Ge => operand.to_int_lossy() >= rhs_int(rhs),
            OperatorKind::Gt => operand.to_int_lossy() > rhs_int(rhs),
            OperatorKind::Le => operand.to_int_lossy() <= rhs_int(rhs),
            OperatorKind::Lt => operand.to_int_lossy() < rhs_int(rhs),
            OperatorKind::DetectSqli => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                match detect::detect_sqli(subject) {
                    Some((from, to)) => {
                        txn.stage_capture(0, Variant::from(&subject[from..to]));
                        true
                    }
                    None => false,
                }
            }
            OperatorKind::DetectXss => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                match detect::detect_xss(subject) {
                    Some((from, to)) => {
                        txn.stage_capture(0, Variant::from(&subject[from..to]));
                        true
                    }
                    None => false,
                }
            }
            OperatorKind::UnconditionalMatch => true,
            OperatorKind::NoMatch => false,
            OperatorKind::ValidateByteRange { allowed } => operand
                .as_str()
                .is_some_and(|s| s.bytes().any(|b| !allowed[b as usize])),
            OperatorKind::ValidateDtd => txn.host_validate_dtd(operand, rhs),
            OperatorKind::ValidateSchema => txn.host_validate_schema(operand, rhs),
            OperatorKind::ValidateUrlEncoding => operand
                .as_str()
                .is_some_and(has_invalid_url_encoding),
            OperatorKind::ValidateUtf8Encoding => operand
                .as_str()
                .is_some_and(|s| s.contains('\u{fffd}')),
            OperatorKind::VerifyCc { pattern } => {
                self.verify_digits(txn, operand, pattern, luhn_valid)
            }
            OperatorKind::VerifyCpf { pattern } => {
                self.verify_digits(txn, operand, pattern, cpf_valid)
            }
            OperatorKind::VerifySsn { pattern } => {
                self.verify_digits(txn, operand, pattern, ssn_valid)
            }
            OperatorKind::Rsub { pattern } => {
                operand.as_str().is_some_and(|s| pattern.matches(s))
            }
            OperatorKind::GeoLookup => txn.host_geo_lookup(operand),
            OperatorKind::InspectFile => txn.host_inspect_file(operand, rhs),
            OperatorKind::FuzzyHash => txn.host_fuzzy_hash(operand, rhs),
            OperatorKind::Xor => {
                let Some(subject) = operand.as_str() else {
                    return false;
                };
                xor_scan(subject, rhs)
            }
            OperatorKind::Rbl => txn.host_rbl(operand, rhs),
        }
    }

    /// Resolve the pattern for the rx family, caching macro expansions
    /// through the process-wide intern map.
    fn resolve_pattern(&self, compiled: &Option<Arc<Pattern>>, rhs: &str) -> Option<Arc<Pattern>> {
        if let Some(p) = compiled {
            return Some(p.clone());
        }
        match pattern::intern(rhs, false, self.step_limit) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(pattern = rhs, error = %e, "Macro-expanded pattern failed to compile");
                None
            }
        }
    }

    fn rx_match(
        &self,
        txn: &mut Transaction<'_>,
        pattern: &Pattern,
        subject: &str,
        global: bool,
    ) -> bool {
        if global {
            let spans = pattern.scan(subject);
            if spans.is_empty() {
                return false;
            }
            if self.capture {
                for (index, (from, to)) in spans.iter().take(10).enumerate() {
                    txn.stage_capture(index, Variant::from(&subject[*from..*to]));
                }
            }
            return true;
        }

        if self.capture {
            match pattern.captures(subject) {
                Some(groups) => {
                    for (index, (from, to)) in groups.iter().take(10).enumerate() {
                        txn.stage_capture(index, Variant::from(&subject[*from..*to]));
                    }
                    true
                }
                None => false,
            }
        } else {
            pattern.matches(subject)
        }
    }

    fn verify_digits(
        &self,
        txn: &mut Transaction<'_>,
        operand: &Variant,
        pattern: &Pattern,
        valid: fn(&str) -> bool,
    ) -> bool {
        let Some(subject) = operand.as_str() else {
            return false;
        };
        for (from, to) in pattern.scan(subject) {
            let candidate = &subject[from..to];
            if valid(candidate) {
                txn.stage_capture(0, Variant::from(candidate));
                return true;
            }
        }
        false
    }
}

fn resolve_path(rule_dir: &Path, operand: &str) -> std::path::PathBuf {
    let path = Path::new(operand);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        rule_dir.join(path)
    }
}

fn parse_ip_list(operand: &str) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for entry in operand.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let net = if entry.contains('/') {
            IpNet::from_str(entry)
                .map_err(|e| EngineError::Parse(format!("bad CIDR '{entry}': {e}")))?
        } else {
            IpNet::from(
                IpAddr::from_str(entry)
                    .map_err(|e| EngineError::Parse(format!("bad IP '{entry}': {e}")))?,
            )
        };
        nets.push(net);
    }
    if nets.is_empty() {
        return Err(EngineError::Parse("empty IP list".to_string()));
    }
    Ok(nets)
}

fn parse_byte_ranges(operand: &str) -> Result<Box<[bool; 256]>> {
    let mut allowed = Box::new([false; 256]);
    for part in operand.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (part, part),
        };
        let lo: u16 = lo
            .parse()
            .map_err(|_| EngineError::Parse(format!("bad byte range '{part}'")))?;
        let hi: u16 = hi
            .parse()
            .map_err(|_| EngineError::Parse(format!("bad byte range '{part}'")))?;
        if lo > hi || hi > 255 {
            return Err(EngineError::Parse(format!("bad byte range '{part}'")));
        }
        for b in lo..=hi {
            allowed[b as usize] = true;
        }
    }
    Ok(allowed)
}

fn verify_pattern(operand: &str, default: &str, step_limit: u32) -> Result<Arc<Pattern>> {
    let source = if operand.is_empty() { default } else { operand };
    pattern::intern(source, false, step_limit)
}

/// Parse an `s/pattern/replacement/` operand.
fn parse_rsub(operand: &str) -> Result<(String, String)> {
    let rest = operand
        .strip_prefix("s/")
        .ok_or_else(|| EngineError::Parse(format!("bad rsub operand '{operand}'")))?;
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if next != '/' {
                        current.push('\\');
                    }
                    current.push(next);
                }
            }
            '/' => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if parts.len() < 2 {
        return Err(EngineError::Parse(format!("bad rsub operand '{operand}'")));
    }
    Ok((parts[0].clone(), parts[1].clone()))
}

fn contains_word(subject: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = subject[start..].find(word) {
        let from = start + pos;
        let to = from + word.len();
        let before_ok = from == 0
            || !subject[..from]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after_ok = to == subject.len()
            || !subject[to..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        start = from + 1;
    }
    false
}

fn has_invalid_url_encoding(subject: &str) -> bool {
    let bytes = subject.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

fn rhs_int(rhs: &str) -> i64 {
    Variant::from(rhs).to_int_lossy()
}

/// Single-byte XOR sweep: matches when XOR-decoding the subject with any key
/// reveals the operand keyword (case-insensitive).
fn xor_scan(subject: &str, keyword: &str) -> bool {
    if keyword.is_empty() || subject.len() < keyword.len() {
        return false;
    }
    let lowered = keyword.to_ascii_lowercase();
    for key in 1u8..=255 {
        let decoded: Vec<u8> = subject.bytes().map(|b| b ^ key).collect();
        let decoded = decoded.to_ascii_lowercase();
        if memmem::find(&decoded, lowered.as_bytes()).is_some() {
            return true;
        }
    }
    false
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn cpf_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 {
        return false;
    }
    if digits.windows(2).all(|w| w[0] == w[1]) {
        return false;
    }
    let check = |count: usize| -> u32 {
        let sum: u32 = digits[..count]
            .iter()
            .enumerate()
            .map(|(i, &d)| d * (count as u32 + 1 - i as u32))
            .sum();
        let rem = (sum * 10) % 11;
        if rem == 10 {
            0
        } else {
            rem
        }
    };
    check(9) == digits[9] && check(10) == digits[10]
}

fn ssn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 9 {
        return false;
    }
    let area = digits[0] * 100 + digits[1] * 10 + digits[2];
    let group = digits[3] * 10 + digits[4];
    let serial = digits[5] * 1000 + digits[6] * 100 + digits[7] * 10 + digits[8];
    area != 0 && area != 666 && area < 900 && group != 0 && serial != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_word() {
        assert!(contains_word("drop table users", "table"));
        assert!(!contains_word("unstable", "table"));
        assert!(contains_word("table!", "table"));
    }

    #[test]
    fn test_byte_ranges() {
        let allowed = parse_byte_ranges("32-126,10,13").unwrap();
        assert!(allowed[65]);
        assert!(allowed[10]);
        assert!(!allowed[0]);
        assert!(parse_byte_ranges("200-100").is_err());
    }

    #[test]
    fn test_ip_list() {
        let nets = parse_ip_list("192.168.0.0/16, 10.0.0.1").unwrap();
        let inside: IpAddr = "192.168.4.4".parse().unwrap();
        let outside: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(nets.iter().any(|n| n.contains(&inside)));
        assert!(!nets.iter().any(|n| n.contains(&outside)));
    }

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4111111111111111"));
        assert!(!luhn_valid("4111111111111112"));
    }

    #[test]
    fn test_ssn_rules() {
        assert!(ssn_valid("219099999"));
        assert!(!ssn_valid("666121234"));
        assert!(!ssn_valid("000121234"));
        assert!(!ssn_valid("219001234"));
    }

    #[test]
    fn test_rsub_parse() {
        let (pat, repl) = parse_rsub("s/foo/bar/").unwrap();
        assert_eq!(pat, "foo");
        assert_eq!(repl, "bar");
        assert!(parse_rsub("nonsense").is_err());
    }

    #[test]
    fn test_invalid_url_encoding() {
        assert!(has_invalid_url_encoding("a%zzb"));
        assert!(has_invalid_url_encoding("trailing%2"));
        assert!(!has_invalid_url_encoding("a%20b"));
    }

    #[test]
    fn test_xor_sweep() {
        let plain = "select";
        let encoded: String = plain.bytes().map(|b| (b ^ 0x42) as char).collect();
        assert!(xor_scan(&encoded, "SELECT"));
        assert!(!xor_scan("random text", "select"));
    }
}
