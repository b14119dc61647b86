//! `%{VARIABLE}` macro strings.
//!
//! Operator operands, `setvar` keys/values, `msg` and `logdata` texts may
//! embed variable references that are expanded once per evaluation. An
//! undefined variable expands to the empty string; expansion never fails at
//! request time.

use tracing::warn;

use crate::rule::Rule;
use crate::transaction::Transaction;
use crate::variable::{Results, SubName, Variable, VariableKind};

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Var(Variable),
}

/// A parsed macro string.
#[derive(Debug, Clone)]
pub struct Expansion {
    literal: String,
    segments: Vec<Segment>,
    dynamic: bool,
}

impl Expansion {
    /// True when `text` contains a `%{...}` reference.
    pub fn contains_macro(text: &str) -> bool {
        text.contains("%{")
    }

    /// Parse `text`, splitting literal runs from `%{name}` / `%{name.sub}`
    /// references. Unknown variable names expand to the empty string.
    pub fn parse(text: &str) -> Expansion {
        let mut segments = Vec::new();
        let mut dynamic = false;
        let mut rest = text;
        while let Some(start) = rest.find("%{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let Some(end) = rest[start..].find('}') else {
                segments.push(Segment::Literal(rest[start..].to_string()));
                rest = "";
                break;
            };
            let reference = &rest[start + 2..start + end];
            match parse_macro_variable(reference) {
                Some(var) => {
                    dynamic = true;
                    segments.push(Segment::Var(var));
                }
                None => {
                    warn!(reference = reference, "Unknown macro variable, expands to empty");
                    segments.push(Segment::Literal(String::new()));
                }
            }
            rest = &rest[start + end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Expansion {
            literal: text.to_string(),
            segments,
            dynamic,
        }
    }

    /// The source text of the macro string.
    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// True when expansion depends on transaction state.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Expand against the transaction. `rule` is the rule being evaluated
    /// (read by `RULE` / `MATCHED_*` references).
    pub fn expand(&self, txn: &mut Transaction<'_>, rule: &Rule) -> String {
        let mut out = String::with_capacity(self.literal.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(var) => {
                    let mut results = Results::new();
                    var.evaluate(txn, rule, &mut results);
                    if let Some(first) = results.first() {
                        out.push_str(&first.value.to_text());
                    }
                }
            }
        }
        out
    }
}

/// Parse a macro variable reference: `NAME`, `NAME.sub` or `NAME:sub`.
pub fn parse_macro_variable(reference: &str) -> Option<Variable> {
    let (main, sub) = match reference.find(['.', ':']) {
        Some(pos) => (&reference[..pos], &reference[pos + 1..]),
        None => (reference, ""),
    };
    let kind = VariableKind::from_name(main)?;
    let sub_name = if sub.is_empty() {
        SubName::None
    } else {
        SubName::Literal(sub.to_ascii_lowercase())
    };
    Some(Variable::new(kind, sub_name, false, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_text() {
        let e = Expansion::parse("no macros here");
        assert!(!e.is_dynamic());
        assert!(!Expansion::contains_macro("no macros here"));
    }

    #[test]
    fn test_parse_reference() {
        let e = Expansion::parse("score=%{tx.score}!");
        assert!(e.is_dynamic());
        assert!(Expansion::contains_macro(e.literal()));
    }

    #[test]
    fn test_macro_variable_forms() {
        assert!(parse_macro_variable("REMOTE_ADDR").is_some());
        assert!(parse_macro_variable("tx.score").is_some());
        assert!(parse_macro_variable("TX:1").is_some());
        assert!(parse_macro_variable("NO_SUCH_VAR").is_none());
    }
}
