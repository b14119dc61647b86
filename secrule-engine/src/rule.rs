//! The rule: variables + transformations + operator + actions + flow flags.
//!
//! Evaluation order per rule:
//! 1. each accepted variable is extracted (collections element-wise);
//! 2. each value runs through the default-action transforms then the rule's
//!    own (unless `multiMatch`, which re-tests the operator at every stage);
//! 3. the operator tests the transformed value, `!@` folding the outcome;
//! 4. on a match the variable is recorded and the matched-branch actions run;
//! 5. a chained rule must also match for the rule to count as matched;
//! 6. `msg` / `logdata` macros expand once per matched rule.

use std::sync::Arc;

use tracing::trace;

use crate::action::{Action, Branch, MacroText};
use crate::operator::Operator;
use crate::transform::Transform;
use crate::transaction::Transaction;
use crate::variable::{ExceptMatcher, Results, SubName, Variable};
use crate::variant::Variant;

/// Syslog-scaled severity (0 is most severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Severity> {
        Some(match s.to_ascii_uppercase().as_str() {
            "EMERGENCY" | "0" => Severity::Emergency,
            "ALERT" | "1" => Severity::Alert,
            "CRITICAL" | "2" => Severity::Critical,
            "ERROR" | "3" => Severity::Error,
            "WARNING" | "4" => Severity::Warning,
            "NOTICE" | "5" => Severity::Notice,
            "INFO" | "6" => Severity::Info,
            "DEBUG" | "7" => Severity::Debug,
            _ => return None,
        })
    }
}

/// Disruptive outcome carried by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disruptive {
    /// Stop rule processing entirely and let the transaction proceed.
    Allow,
    /// Stop the current phase; later phases run as normal.
    AllowPhase,
    /// Stop request-side processing; resume at response headers.
    AllowRequest,
    /// Defer to the phase's SecDefaultAction disruptive.
    Block,
    /// Intercept the transaction.
    Deny,
    /// Same as deny at this engine level.
    Drop,
    /// Continue with the next rule in spite of the match.
    #[default]
    Pass,
    /// Client-visible redirect to `rule.redirect` with `rule.status`.
    Redirect,
}

/// A compiled rule. Chained rules live inside their parent; only top-level
/// rules appear in the phase vectors.
#[derive(Debug)]
pub struct Rule {
    // Meta-data
    pub id: u64,
    pub phase: u8,
    /// Position in the phase vector; -1 until inserted.
    pub index: i32,
    pub severity: Option<Severity>,
    pub msg: Option<MacroText>,
    pub tags: Vec<Arc<str>>,
    pub rev: String,
    pub ver: String,
    pub accuracy: i32,
    pub maturity: i32,

    // Evaluation nodes
    pub variables: Vec<Variable>,
    pub except_variables: Vec<Variable>,
    pub operator: Option<Operator>,
    pub transforms: Vec<Transform>,
    pub ignore_default_transforms: bool,
    pub actions: Vec<Action>,

    // Non-disruptive flags
    pub audit_log: Option<bool>,
    pub log: Option<bool>,
    pub log_data: Option<MacroText>,
    pub multi_match: bool,

    // Flow
    pub skip: u32,
    pub skip_after: String,
    pub chain: Option<Box<Rule>>,
    /// -1 for top-level rules, 0,1,.. for successive chained children.
    pub chain_index: i32,

    // Disruptive
    pub disruptive: Disruptive,
    pub redirect: String,
    pub status: u16,

    // Diagnostics
    pub file: Arc<str>,
    pub line: usize,
}

impl Rule {
    pub fn new(file: Arc<str>, line: usize) -> Self {
        Rule {
            id: 0,
            phase: 2,
            index: -1,
            severity: None,
            msg: None,
            tags: Vec::new(),
            rev: String::new(),
            ver: String::new(),
            accuracy: 0,
            maturity: 0,
            variables: Vec::new(),
            except_variables: Vec::new(),
            operator: None,
            transforms: Vec::new(),
            ignore_default_transforms: false,
            actions: Vec::new(),
            audit_log: None,
            log: None,
            log_data: None,
            multi_match: false,
            skip: 0,
            skip_after: String::new(),
            chain: None,
            chain_index: -1,
            disruptive: Disruptive::Pass,
            redirect: String::new(),
            status: 403,
            file,
            line,
        }
    }

    /// Append an accepted or excepted variable, deduplicating accepted ones
    /// by full name.
    pub fn append_variable(&mut self, var: Variable) {
        if var.is_not() {
            self.except_variables.push(var);
            return;
        }
        let full_name = var.full_name();
        if self.variables.iter().any(|v| v.full_name() == full_name) {
            return;
        }
        self.variables.push(var);
    }

    /// Create the chained child (inheriting the phase) and return it for the
    /// parser to populate.
    pub fn append_chain_rule(&mut self, line: usize) -> &mut Rule {
        let mut child = Rule::new(self.file.clone(), line);
        child.phase = self.phase;
        child.chain_index = self.chain_index + 1;
        self.chain = Some(Box::new(child));
        self.chain.as_mut().unwrap()
    }

    /// Depth of the chain hanging off this rule.
    pub fn chain_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.chain.as_deref();
        while let Some(rule) = cursor {
            len += 1;
            cursor = rule.chain.as_deref();
        }
        len
    }

    /// Fold the `!var` entries into the accepted list: exact and
    /// regex-matched entries are dropped; exceptions against a collection
    /// attach to the collection node's exception set. Runs once, before the
    /// rule set freezes.
    pub fn init_except_variables(&mut self) {
        let except_variables = std::mem::take(&mut self.except_variables);
        for except in &except_variables {
            let except_name = except.full_name();
            let except_sub = &except.sub_name;

            self.variables.retain(|var| {
                let var_name = var.full_name();
                if var_name.main != except_name.main {
                    return true;
                }
                // exception names the whole collection, or the same entry
                if except_name.sub.is_empty() || var_name.sub == except_name.sub {
                    return false;
                }
                // regex exception matched against a literal sub-name
                if !var_name.sub.is_empty() {
                    if let SubName::Regex { pattern, .. } = except_sub {
                        if pattern.matches(&var_name.sub) {
                            return false;
                        }
                    }
                }
                true
            });

            if except_name.sub.is_empty() {
                continue;
            }
            for var in &mut self.variables {
                if var.full_name().main != except_name.main || !var.is_collection() {
                    continue;
                }
                match except_sub {
                    SubName::Literal(name) => var.except.add_literal(name),
                    SubName::Regex { pattern, .. } => {
                        var.except.add_matcher(ExceptMatcher::Regex(pattern.clone()))
                    }
                    SubName::File { set, .. } => {
                        var.except.add_matcher(ExceptMatcher::File(set.clone()))
                    }
                    SubName::None => {}
                }
            }
        }
        self.except_variables = except_variables;

        if let Some(chain) = self.chain.as_mut() {
            chain.init_except_variables();
        }
    }

    /// Inherit unset flags from the phase's SecDefaultAction rule.
    pub fn init_flags(&mut self, default_action: &Rule) {
        if self.log.is_none() {
            self.log = default_action.log;
        }
        if self.audit_log.is_none() {
            self.audit_log = default_action.audit_log;
        }
        if self.severity.is_none() {
            self.severity = default_action.severity;
        }
        if let Some(chain) = self.chain.as_mut() {
            chain.init_flags(default_action);
        }
    }

    /// Evaluate the rule against the transaction. `default_action` is the
    /// phase's SecDefaultAction rule, consulted for transforms and actions.
    pub fn evaluate(&self, txn: &mut Transaction<'_>, default_action: Option<&Rule>) -> bool {
        // SecAction: no operator, actions run once with the matched branch
        let Some(operator) = self.operator.as_ref() else {
            trace!(rule_id = self.id, file = %self.file, line = self.line, "evaluate SecAction");
            self.apply_actions(txn, true);
            return true;
        };

        trace!(rule_id = self.id, file = %self.file, line = self.line, "evaluate SecRule");

        let mut rule_matched = if self.multi_match {
            self.evaluate_multi_match(txn, default_action, operator)
        } else {
            self.evaluate_single_match(txn, default_action, operator)
        };

        if rule_matched {
            if let Some(chain) = self.chain.as_deref() {
                trace!(rule_id = chain.id, "evaluate chained rule");
                if !chain.evaluate(txn, default_action) {
                    rule_matched = false;
                }
            }
        }

        if rule_matched {
            self.expand_log_macros(txn);
        }

        rule_matched
    }

    fn evaluate_single_match(
        &self,
        txn: &mut Transaction<'_>,
        default_action: Option<&Rule>,
        operator: &Operator,
    ) -> bool {
        let mut rule_matched = false;

        for var in &self.variables {
            let mut results = Results::new();
            var.evaluate(txn, self, &mut results);

            for element in results.drain(..) {
                let (operand, transforms_applied) =
                    self.apply_transforms(txn, default_action, &element.value);

                let variable_matched = self.test_operator(txn, operator, &operand);

                if variable_matched {
                    trace!(
                        variable = %var.full_name(),
                        sub = element.sub_name.as_deref().unwrap_or(""),
                        "variable matched"
                    );
                    txn.push_matched_variable(
                        var,
                        self.chain_index,
                        element,
                        operand,
                        transforms_applied,
                    );
                    rule_matched = true;
                    self.apply_default_actions(txn, default_action);
                    self.apply_actions(txn, true);
                } else {
                    self.apply_actions(txn, false);
                }
            }
        }

        rule_matched
    }

    /// `multiMatch`: the operator runs on the stream of values produced by
    /// each transform stage, stopping the chain for a value as soon as a
    /// stage matches.
    fn evaluate_multi_match(
        &self,
        txn: &mut Transaction<'_>,
        default_action: Option<&Rule>,
        operator: &Operator,
    ) -> bool {
        let mut all_transforms: Vec<Transform> = Vec::new();
        if !self.ignore_default_transforms {
            if let Some(default) = default_action {
                all_transforms.extend_from_slice(&default.transforms);
            }
        }
        all_transforms.extend_from_slice(&self.transforms);

        let mut rule_matched = false;

        for var in &self.variables {
            let mut results = Results::new();
            var.evaluate(txn, self, &mut results);

            for element in results.drain(..) {
                let mut stage = element.value.clone();
                let mut applied: Vec<Transform> = Vec::new();
                let mut next_transform = 0;

                loop {
                    let variable_matched = self.test_operator(txn, operator, &stage);
                    if variable_matched {
                        txn.push_matched_variable(
                            var,
                            self.chain_index,
                            element.clone(),
                            stage.clone(),
                            applied.clone(),
                        );
                        rule_matched = true;
                        self.apply_default_actions(txn, default_action);
                        self.apply_actions(txn, true);
                        break;
                    }
                    self.apply_actions(txn, false);

                    if stage.as_str().is_none() {
                        break;
                    }
                    // advance to the next transform that changes the value
                    let mut advanced = false;
                    while next_transform < all_transforms.len() {
                        let transform = all_transforms[next_transform];
                        next_transform += 1;
                        if let Some(new_stage) = txn.apply_transform_cached(&stage, transform) {
                            applied.push(transform);
                            stage = new_stage;
                            advanced = true;
                            break;
                        }
                    }
                    if !advanced {
                        break;
                    }
                }
            }
        }

        rule_matched
    }

    /// Run the default-action transforms then the rule's own, through the
    /// transaction cache. Returns the final operand and the transforms that
    /// changed it.
    fn apply_transforms(
        &self,
        txn: &mut Transaction<'_>,
        default_action: Option<&Rule>,
        value: &Variant,
    ) -> (Variant, Vec<Transform>) {
        let mut current = value.clone();
        let mut applied = Vec::new();

        if current.as_str().is_none() {
            // transforms on non-string variants are skipped; the operator
            // still sees the original value
            return (current, applied);
        }

        if !self.ignore_default_transforms {
            if let Some(default) = default_action {
                for &transform in &default.transforms {
                    if let Some(next) = txn.apply_transform_cached(&current, transform) {
                        applied.push(transform);
                        current = next;
                    }
                }
            }
        }
        for &transform in &self.transforms {
            if let Some(next) = txn.apply_transform_cached(&current, transform) {
                applied.push(transform);
                current = next;
            }
        }

        (current, applied)
    }

    /// Operator test with `!@` folding, the host's additional condition, and
    /// capture staging discipline.
    fn test_operator(&self, txn: &mut Transaction<'_>, operator: &Operator, operand: &Variant) -> bool {
        let mut matched = operator.evaluate(txn, operand, self);
        matched = operator.is_not ^ matched;

        if matched {
            if let Some(subject) = operand.as_str() {
                if !txn.additional_condition_holds(self, subject) {
                    matched = false;
                }
            }
        }

        if matched {
            txn.merge_staged_captures();
        } else {
            txn.clear_staged_captures();
        }

        trace!(
            operator = operator.name(),
            negated = operator.is_not,
            matched,
            "evaluate operator"
        );
        matched
    }

    fn apply_default_actions(&self, txn: &mut Transaction<'_>, default_action: Option<&Rule>) {
        if let Some(default) = default_action {
            for action in &default.actions {
                if matches!(action.branch, Branch::Matched | Branch::Always) {
                    action.evaluate(txn, self);
                }
            }
        }
    }

    fn apply_actions(&self, txn: &mut Transaction<'_>, matched: bool) {
        for action in &self.actions {
            let run = match action.branch {
                Branch::Matched => matched,
                Branch::Unmatched => !matched,
                Branch::Always => true,
            };
            if run {
                action.evaluate(txn, self);
            }
        }
    }

    fn expand_log_macros(&self, txn: &mut Transaction<'_>) {
        if let Some(MacroText::Macro(msg)) = &self.msg {
            let expanded = msg.expand(txn, self);
            trace!(msg = %expanded, "expanded msg macro");
            txn.msg_expanded = Some(expanded);
        }
        if let Some(MacroText::Macro(log_data)) = &self.log_data {
            let expanded = log_data.expand(txn, self);
            trace!(logdata = %expanded, "expanded logdata macro");
            txn.log_data_expanded = Some(expanded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::{SubName, Variable, VariableKind};

    fn test_rule() -> Rule {
        Rule::new(Arc::from("test.conf"), 1)
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("2"), Some(Severity::Critical));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn test_append_variable_dedup() {
        let mut rule = test_rule();
        rule.append_variable(Variable::new(VariableKind::Args, SubName::None, false, false));
        rule.append_variable(Variable::new(VariableKind::Args, SubName::None, false, false));
        assert_eq!(rule.variables.len(), 1);

        rule.append_variable(Variable::new(VariableKind::Args, SubName::None, true, false));
        assert_eq!(rule.except_variables.len(), 1);
    }

    #[test]
    fn test_chain_indices() {
        let mut rule = test_rule();
        rule.phase = 1;
        let child = rule.append_chain_rule(2);
        assert_eq!(child.phase, 1);
        assert_eq!(child.chain_index, 0);
        let grandchild = rule.chain.as_mut().unwrap().append_chain_rule(3);
        assert_eq!(grandchild.chain_index, 1);
        assert_eq!(rule.chain_len(), 2);
    }

    #[test]
    fn test_except_removes_exact_entry() {
        let mut rule = test_rule();
        rule.append_variable(Variable::new(
            VariableKind::Args,
            SubName::Literal("safe".into()),
            false,
            false,
        ));
        rule.append_variable(Variable::new(
            VariableKind::Args,
            SubName::Literal("risky".into()),
            false,
            false,
        ));
        rule.append_variable(Variable::new(
            VariableKind::Args,
            SubName::Literal("safe".into()),
            true,
            false,
        ));
        rule.init_except_variables();
        assert_eq!(rule.variables.len(), 1);
        assert_eq!(rule.variables[0].full_name().sub, "risky");
    }

    #[test]
    fn test_except_attaches_to_collection() {
        let mut rule = test_rule();
        rule.append_variable(Variable::new(VariableKind::Args, SubName::None, false, false));
        rule.append_variable(Variable::new(
            VariableKind::Args,
            SubName::Literal("token".into()),
            true,
            false,
        ));
        rule.init_except_variables();
        assert_eq!(rule.variables.len(), 1);
        assert!(rule.variables[0].except.contains("token"));
        assert!(!rule.variables[0].except.contains("other"));
    }

    #[test]
    fn test_flag_inheritance() {
        let mut default = test_rule();
        default.log = Some(false);
        default.severity = Some(Severity::Warning);

        let mut rule = test_rule();
        rule.log = Some(true);
        rule.init_flags(&default);
        assert_eq!(rule.log, Some(true));
        assert_eq!(rule.severity, Some(Severity::Warning));
    }
}
