//! Runtime action nodes.
//!
//! Meta-data actions (`id`, `msg`, `tag`, `severity`, flow and disruptive
//! flags, `t:` lists) are consumed at parse time and become fields on the
//! rule. What remains here are the actions with per-transaction effects:
//! `setvar`, `setenv`, `initcol`, the session/user/resource key setters and
//! `ctl`.

use tracing::{debug, warn};

use crate::config::{AuditEngine, BodyProcessor, EngineOption, PHASE_TOTAL};
use crate::expansion::Expansion;
use crate::rule::Rule;
use crate::transaction::Transaction;
use crate::variant::Variant;

/// When an action applies, relative to the operator outcome for the current
/// variable. `Unmatched` / `Always` are only legal inside `SecRule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Branch {
    #[default]
    Matched,
    Unmatched,
    Always,
}

/// A string argument that may embed `%{...}` references.
#[derive(Debug, Clone)]
pub enum MacroText {
    Literal(String),
    Macro(Expansion),
}

impl MacroText {
    pub fn parse(text: &str) -> MacroText {
        if Expansion::contains_macro(text) {
            MacroText::Macro(Expansion::parse(text))
        } else {
            MacroText::Literal(text.to_string())
        }
    }

    pub fn literal(&self) -> &str {
        match self {
            MacroText::Literal(s) => s,
            MacroText::Macro(m) => m.literal(),
        }
    }

    pub fn resolve(&self, txn: &mut Transaction<'_>, rule: &Rule) -> String {
        match self {
            MacroText::Literal(s) => s.clone(),
            MacroText::Macro(m) => m.expand(txn, rule),
        }
    }
}

/// `setvar` evaluation type, derived from the action grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetVarOp {
    /// `setvar:tx.flag`
    Create,
    /// `setvar:tx.score=5`
    CreateAndInit,
    /// `setvar:!tx.score`
    Remove,
    /// `setvar:tx.score=+5`
    Increase,
    /// `setvar:tx.score=-5`
    Decrease,
}

/// A `setvar` target: collection plus key, with the TX slot pre-resolved at
/// compile time when the key is a literal.
#[derive(Debug, Clone)]
pub struct SetVarTarget {
    pub collection: String,
    pub key: MacroText,
    /// Pre-resolved index into the transaction's TX slot table.
    pub slot: Option<usize>,
}

/// Per-transaction configuration mutations (`ctl:` action).
#[derive(Debug, Clone)]
pub enum Ctl {
    AuditEngine(AuditEngine),
    AuditLogParts(u32),
    RequestBodyAccess(bool),
    RequestBodyProcessor(BodyProcessor),
    RuleEngine(EngineOption),
    RuleRemoveById(u64),
    RuleRemoveByIdRange(u64, u64),
    RuleRemoveByTag(String),
    RuleRemoveTargetById { id: u64, main: String, sub: String },
    RuleRemoveTargetByTag { tag: String, main: String, sub: String },
}

/// Rule positions resolved once at `Engine::init`, so request-time ctl
/// evaluation never searches the indices.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRules {
    pub by_phase: [Vec<usize>; PHASE_TOTAL],
}

/// A runtime action node.
#[derive(Debug, Clone)]
pub enum ActionKind {
    SetVar {
        target: SetVarTarget,
        value: MacroText,
        op: SetVarOp,
    },
    SetEnv {
        key: MacroText,
        value: MacroText,
    },
    SetUid(MacroText),
    SetSid(MacroText),
    SetRsc(MacroText),
    InitCol {
        collection: String,
        key: MacroText,
    },
    Ctl {
        ctl: Ctl,
        resolved: ResolvedRules,
    },
}

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub branch: Branch,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Action {
            kind,
            branch: Branch::Matched,
        }
    }

    /// Apply the action to the transaction.
    pub fn evaluate(&self, txn: &mut Transaction<'_>, rule: &Rule) {
        match &self.kind {
            ActionKind::SetVar { target, value, op } => {
                self.eval_setvar(txn, rule, target, value, *op)
            }
            ActionKind::SetEnv { key, value } => {
                let key = key.resolve(txn, rule);
                let value = value.resolve(txn, rule);
                debug!(key = %key, "setenv");
                std::env::set_var(key, value);
            }
            ActionKind::SetUid(key) => {
                let key = key.resolve(txn, rule);
                txn.set_collection_key("USER", key);
            }
            ActionKind::SetSid(key) => {
                let key = key.resolve(txn, rule);
                txn.set_collection_key("SESSION", key);
            }
            ActionKind::SetRsc(key) => {
                let key = key.resolve(txn, rule);
                txn.set_collection_key("RESOURCE", key);
            }
            ActionKind::InitCol { collection, key } => {
                let key = key.resolve(txn, rule);
                debug!(collection = %collection, key = %key, "initcol");
                txn.set_collection_key_owned(collection.clone(), key);
            }
            ActionKind::Ctl { ctl, resolved } => self.eval_ctl(txn, ctl, resolved),
        }
    }

    fn eval_setvar(
        &self,
        txn: &mut Transaction<'_>,
        rule: &Rule,
        target: &SetVarTarget,
        value: &MacroText,
        op: SetVarOp,
    ) {
        if !target.collection.eq_ignore_ascii_case("tx") {
            // writes to persistent collections go through the host store
            let key = target.key.resolve(txn, rule).to_ascii_lowercase();
            let value = value.resolve(txn, rule);
            txn.persistent_put(&target.collection, &key, value, op);
            return;
        }

        match op {
            SetVarOp::Create => {
                self.write_tx(txn, rule, target, Variant::Int(1));
            }
            SetVarOp::CreateAndInit => {
                let text = value.resolve(txn, rule);
                let variant = match text.parse::<i64>() {
                    Ok(i) => Variant::Int(i),
                    Err(_) => Variant::from(text),
                };
                self.write_tx(txn, rule, target, variant);
            }
            SetVarOp::Remove => match target.slot {
                Some(slot) => txn.remove_tx_variable_by_slot(slot),
                None => {
                    let key = target.key.resolve(txn, rule);
                    txn.remove_tx_variable(&key);
                }
            },
            SetVarOp::Increase | SetVarOp::Decrease => {
                let text = value.resolve(txn, rule);
                let mut delta = Variant::from(text.as_str()).to_int_lossy();
                if op == SetVarOp::Decrease {
                    delta = -delta;
                }
                match target.slot {
                    Some(slot) => txn.increase_tx_variable_by_slot(slot, delta),
                    None => {
                        let key = target.key.resolve(txn, rule);
                        txn.increase_tx_variable(&key, delta);
                    }
                }
            }
        }
    }

    fn write_tx(
        &self,
        txn: &mut Transaction<'_>,
        rule: &Rule,
        target: &SetVarTarget,
        value: Variant,
    ) {
        match target.slot {
            Some(slot) => txn.set_tx_variable_by_slot(slot, value),
            None => {
                let key = target.key.resolve(txn, rule);
                txn.set_tx_variable(&key, value);
            }
        }
    }

    fn eval_ctl(&self, txn: &mut Transaction<'_>, ctl: &Ctl, resolved: &ResolvedRules) {
        match ctl {
            Ctl::AuditEngine(mode) => txn.overrides.audit_engine = Some(*mode),
            Ctl::AuditLogParts(parts) => txn.overrides.audit_log_parts = Some(*parts),
            Ctl::RequestBodyAccess(enabled) => {
                txn.overrides.request_body_access = Some(*enabled)
            }
            Ctl::RequestBodyProcessor(processor) => {
                if *processor == BodyProcessor::Xml {
                    // XML parsing is delegated to the host; record the
                    // processor error so REQBODY_PROCESSOR_ERROR rules fire.
                    warn!("ctl:requestBodyProcessor=XML requested without an XML collaborator");
                    txn.reqbody_processor_error = true;
                }
                txn.body_processor = Some(*processor);
            }
            Ctl::RuleEngine(mode) => txn.overrides.rule_engine = Some(*mode),
            Ctl::RuleRemoveById(_)
            | Ctl::RuleRemoveByIdRange(..)
            | Ctl::RuleRemoveByTag(_) => {
                txn.remove_rules(resolved);
            }
            Ctl::RuleRemoveTargetById { main, sub, .. }
            | Ctl::RuleRemoveTargetByTag { main, sub, .. } => {
                txn.remove_rule_targets(resolved, main, sub);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_text_parse() {
        assert!(matches!(MacroText::parse("plain"), MacroText::Literal(_)));
        assert!(matches!(
            MacroText::parse("ip=%{REMOTE_ADDR}"),
            MacroText::Macro(_)
        ));
    }

    #[test]
    fn test_default_branch_is_matched() {
        let action = Action::new(ActionKind::SetUid(MacroText::parse("u%{tx.id}")));
        assert_eq!(action.branch, Branch::Matched);
    }
}
