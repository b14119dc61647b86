//! The compiled rule set: phase-indexed rule vectors, default-action rules,
//! markers, lookup indices and the interned TX-variable slot map.
//!
//! The set is mutable while directives load and freezes at `Engine::init`;
//! request-time code only ever reads it. Markers record the index of the
//! last preceding rule per phase at definition time; every compile-time
//! removal rewrites both the rule indices and those snapshots.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::action::{ActionKind, Ctl, ResolvedRules};
use crate::config::PHASE_TOTAL;
use crate::error::{EngineError, Result};
use crate::rule::Rule;

/// Per-phase marker snapshot: index of the last preceding rule, -1 if none.
pub type MarkerSnapshot = [i32; PHASE_TOTAL];

#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules_by_phase: [Vec<Rule>; PHASE_TOTAL],
    pub default_actions: [Option<Rule>; PHASE_TOTAL],
    markers: HashMap<String, MarkerSnapshot>,
    rules_by_id: HashMap<u64, (u8, usize)>,
    rules_by_msg: HashMap<String, Vec<(u8, usize)>>,
    rules_by_tag: HashMap<String, Vec<(u8, usize)>>,
    /// Case-folded TX variable name -> slot index.
    tx_slots: HashMap<String, usize>,
    tx_slot_names: Vec<String>,
    frozen: bool,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn assert_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(EngineError::InvalidState(
                "rule set is frozen; load directives before Engine::init".to_string(),
            ));
        }
        Ok(())
    }

    /// Insert a top-level rule into its phase vector.
    pub fn add_rule(&mut self, mut rule: Rule) -> Result<()> {
        self.assert_mutable()?;
        let phase = rule.phase;
        if !(1..=PHASE_TOTAL as u8).contains(&phase) {
            return Err(EngineError::Config(format!(
                "rule {} has invalid phase {phase}",
                rule.id
            )));
        }
        let rules = &mut self.rules_by_phase[phase as usize - 1];
        let index = rules.len();
        rule.index = index as i32;

        if rule.id != 0 {
            if self.rules_by_id.contains_key(&rule.id) {
                return Err(EngineError::Config(format!(
                    "duplicate rule id {} at {}:{}",
                    rule.id, rule.file, rule.line
                )));
            }
            self.rules_by_id.insert(rule.id, (phase, index));
        }
        if let Some(msg) = &rule.msg {
            self.rules_by_msg
                .entry(msg.literal().to_string())
                .or_default()
                .push((phase, index));
        }
        for tag in &rule.tags {
            self.rules_by_tag
                .entry(tag.to_string())
                .or_default()
                .push((phase, index));
        }

        rules.push(rule);
        Ok(())
    }

    /// Install the phase's SecDefaultAction rule. Redefinition replaces.
    pub fn set_default_action(&mut self, rule: Rule) -> Result<()> {
        self.assert_mutable()?;
        let phase = rule.phase;
        if !(1..=PHASE_TOTAL as u8).contains(&phase) {
            return Err(EngineError::Config(format!(
                "SecDefaultAction has invalid phase {phase}"
            )));
        }
        self.default_actions[phase as usize - 1] = Some(rule);
        Ok(())
    }

    /// Record a SecMarker: snapshot the current tail index of every phase.
    pub fn add_marker(&mut self, name: &str) -> Result<()> {
        self.assert_mutable()?;
        let mut snapshot = [0i32; PHASE_TOTAL];
        for (phase, rules) in self.rules_by_phase.iter().enumerate() {
            snapshot[phase] = rules.len() as i32 - 1;
        }
        self.markers.insert(name.to_string(), snapshot);
        Ok(())
    }

    /// Marker snapshot for a phase: index of the last rule preceding the
    /// marker, or -1.
    pub fn marker_prev_index(&self, name: &str, phase: u8) -> Option<i32> {
        self.markers
            .get(name)
            .map(|snapshot| snapshot[phase as usize - 1])
    }

    pub fn find_rule(&self, id: u64) -> Option<&Rule> {
        let (phase, index) = *self.rules_by_id.get(&id)?;
        self.rules_by_phase[phase as usize - 1].get(index)
    }

    pub fn rule_mut_by_id(&mut self, id: u64) -> Option<&mut Rule> {
        let (phase, index) = *self.rules_by_id.get(&id)?;
        self.rules_by_phase[phase as usize - 1].get_mut(index)
    }

    pub fn rules_by_tag(&self, tag: &str) -> Vec<(u8, usize)> {
        self.rules_by_tag.get(tag).cloned().unwrap_or_default()
    }

    pub fn rules_by_msg(&self, msg: &str) -> Vec<(u8, usize)> {
        self.rules_by_msg.get(msg).cloned().unwrap_or_default()
    }

    // ---- TX variable slot interning -------------------------------------

    /// Look up (optionally creating) the slot for a TX variable name. Names
    /// are case-insensitive; the interned form is lower-case. Creation is a
    /// compile-time-only operation.
    pub fn tx_slot(&mut self, name: &str, create: bool) -> Option<usize> {
        let folded = name.to_ascii_lowercase();
        if let Some(&slot) = self.tx_slots.get(&folded) {
            return Some(slot);
        }
        if !create || self.frozen {
            return None;
        }
        let slot = self.tx_slot_names.len();
        self.tx_slots.insert(folded.clone(), slot);
        self.tx_slot_names.push(folded);
        Some(slot)
    }

    pub fn tx_slot_lookup(&self, name: &str) -> Option<usize> {
        self.tx_slots.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn tx_slot_name(&self, slot: usize) -> Option<&str> {
        self.tx_slot_names.get(slot).map(String::as_str)
    }

    pub fn tx_slot_count(&self) -> usize {
        self.tx_slot_names.len()
    }

    // ---- Compile-time removal and post-hoc edits ------------------------

    /// SecRuleRemoveById (single ids and ranges).
    pub fn remove_by_id(&mut self, ids: &[(u64, u64)]) -> Result<usize> {
        self.assert_mutable()?;
        self.remove_where(|rule| ids.iter().any(|&(lo, hi)| rule.id >= lo && rule.id <= hi))
    }

    /// SecRuleRemoveByMsg.
    pub fn remove_by_msg(&mut self, msg: &str) -> Result<usize> {
        self.assert_mutable()?;
        self.remove_where(|rule| rule.msg.as_ref().is_some_and(|m| m.literal() == msg))
    }

    /// SecRuleRemoveByTag.
    pub fn remove_by_tag(&mut self, tag: &str) -> Result<usize> {
        self.assert_mutable()?;
        self.remove_where(|rule| rule.tags.iter().any(|t| t.as_ref() == tag))
    }

    /// Remove matching rules, re-point every index and rewrite marker
    /// snapshots so they stay valid positions (or -1).
    fn remove_where(&mut self, predicate: impl Fn(&Rule) -> bool) -> Result<usize> {
        let mut removed_total = 0;
        for phase in 0..PHASE_TOTAL {
            let removed_indices: Vec<usize> = self.rules_by_phase[phase]
                .iter()
                .enumerate()
                .filter(|(_, rule)| predicate(rule))
                .map(|(index, _)| index)
                .collect();
            if removed_indices.is_empty() {
                continue;
            }
            removed_total += removed_indices.len();

            let rules = &mut self.rules_by_phase[phase];
            let mut kept = 0usize;
            for index in 0..rules.len() {
                if removed_indices.contains(&index) {
                    continue;
                }
                if index != kept {
                    rules.swap(index, kept);
                }
                kept += 1;
            }
            rules.truncate(kept);
            for (index, rule) in rules.iter_mut().enumerate() {
                rule.index = index as i32;
            }

            // rewrite marker snapshots for this phase
            for snapshot in self.markers.values_mut() {
                let prev = snapshot[phase];
                if prev >= 0 {
                    let removed_before = removed_indices
                        .iter()
                        .filter(|&&r| (r as i32) <= prev)
                        .count() as i32;
                    snapshot[phase] = prev - removed_before;
                }
            }
        }

        if removed_total > 0 {
            self.rebuild_indices();
            debug!(removed = removed_total, "Removed rules at compile time");
        }
        Ok(removed_total)
    }

    fn rebuild_indices(&mut self) {
        self.rules_by_id.clear();
        self.rules_by_msg.clear();
        self.rules_by_tag.clear();
        for (phase, rules) in self.rules_by_phase.iter().enumerate() {
            for (index, rule) in rules.iter().enumerate() {
                let key = (phase as u8 + 1, index);
                if rule.id != 0 {
                    self.rules_by_id.insert(rule.id, key);
                }
                if let Some(msg) = &rule.msg {
                    self.rules_by_msg
                        .entry(msg.literal().to_string())
                        .or_default()
                        .push(key);
                }
                for tag in &rule.tags {
                    self.rules_by_tag.entry(tag.to_string()).or_default().push(key);
                }
            }
        }
    }

    // ---- Finalisation ----------------------------------------------------

    /// Freeze the set: fold exception variables, inherit default-action
    /// flags, resolve ctl rule references and convert `skipAfter` targets
    /// into numeric skips where the marker lies ahead of the rule.
    pub fn init(&mut self) {
        // snapshot of (id, tags) per position, for ctl resolution
        let mut catalogue: Vec<(u8, usize, u64, Vec<String>)> = Vec::new();
        for (phase, rules) in self.rules_by_phase.iter().enumerate() {
            for (index, rule) in rules.iter().enumerate() {
                catalogue.push((
                    phase as u8 + 1,
                    index,
                    rule.id,
                    rule.tags.iter().map(|t| t.to_string()).collect(),
                ));
            }
        }
        let markers = self.markers.clone();

        for phase in 0..PHASE_TOTAL {
            let default_action = self.default_actions[phase].take();

            for rule in self.rules_by_phase[phase].iter_mut() {
                rule.init_except_variables();

                if let Some(default) = &default_action {
                    rule.init_flags(default);
                }

                resolve_ctl_actions(rule, &catalogue);

                if !rule.skip_after.is_empty() && rule.skip == 0 {
                    if let Some(snapshot) = markers.get(&rule.skip_after) {
                        let prev_index = snapshot[phase];
                        if prev_index != -1 && prev_index > rule.index {
                            rule.skip = (prev_index - rule.index) as u32;
                        }
                    } else {
                        warn!(
                            rule_id = rule.id,
                            marker = %rule.skip_after,
                            "skipAfter target marker is not defined"
                        );
                    }
                }
            }

            self.default_actions[phase] = default_action;
        }

        self.frozen = true;
    }
}

/// Fill in the resolved rule positions of every ctl action, including those
/// on chained rules.
fn resolve_ctl_actions(rule: &mut Rule, catalogue: &[(u8, usize, u64, Vec<String>)]) {
    for action in rule.actions.iter_mut() {
        if let ActionKind::Ctl { ctl, resolved } = &mut action.kind {
            *resolved = resolve_ctl(ctl, catalogue);
        }
    }
    if let Some(chain) = rule.chain.as_deref_mut() {
        resolve_ctl_actions(chain, catalogue);
    }
}

fn resolve_ctl(ctl: &Ctl, catalogue: &[(u8, usize, u64, Vec<String>)]) -> ResolvedRules {
    let mut resolved = ResolvedRules::default();
    let mut push = |phase: u8, index: usize| {
        resolved.by_phase[phase as usize - 1].push(index);
    };
    match ctl {
        Ctl::RuleRemoveById(id) | Ctl::RuleRemoveTargetById { id, .. } => {
            for (phase, index, rule_id, _) in catalogue {
                if rule_id == id {
                    push(*phase, *index);
                }
            }
        }
        Ctl::RuleRemoveByIdRange(lo, hi) => {
            for (phase, index, rule_id, _) in catalogue {
                if rule_id >= lo && rule_id <= hi {
                    push(*phase, *index);
                }
            }
        }
        Ctl::RuleRemoveByTag(tag) | Ctl::RuleRemoveTargetByTag { tag, .. } => {
            for (phase, index, _, tags) in catalogue {
                if tags.iter().any(|t| t == tag) {
                    push(*phase, *index);
                }
            }
        }
        _ => {}
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rule_with_id(id: u64, phase: u8) -> Rule {
        let mut rule = Rule::new(Arc::from("test.conf"), 1);
        rule.id = id;
        rule.phase = phase;
        rule
    }

    #[test]
    fn test_indices_track_positions() {
        let mut set = RuleSet::new();
        set.add_rule(rule_with_id(1, 2)).unwrap();
        set.add_rule(rule_with_id(2, 2)).unwrap();
        set.add_rule(rule_with_id(3, 1)).unwrap();
        assert_eq!(set.rules_by_phase[1][0].index, 0);
        assert_eq!(set.rules_by_phase[1][1].index, 1);
        assert_eq!(set.find_rule(3).unwrap().phase, 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut set = RuleSet::new();
        set.add_rule(rule_with_id(7, 2)).unwrap();
        assert!(set.add_rule(rule_with_id(7, 2)).is_err());
    }

    #[test]
    fn test_removal_reindexes_and_rewrites_markers() {
        let mut set = RuleSet::new();
        set.add_rule(rule_with_id(1, 2)).unwrap();
        set.add_rule(rule_with_id(2, 2)).unwrap();
        set.add_marker("MID").unwrap();
        set.add_rule(rule_with_id(3, 2)).unwrap();

        assert_eq!(set.marker_prev_index("MID", 2), Some(1));

        set.remove_by_id(&[(1, 1)]).unwrap();
        // positions re-pointed
        assert_eq!(set.rules_by_phase[1].len(), 2);
        for (index, rule) in set.rules_by_phase[1].iter().enumerate() {
            assert_eq!(rule.index, index as i32);
        }
        // marker snapshot shifted down with the removal
        assert_eq!(set.marker_prev_index("MID", 2), Some(0));
        assert!(set.find_rule(1).is_none());
        assert_eq!(set.find_rule(3).map(|r| r.index), Some(1));
    }

    #[test]
    fn test_marker_before_any_rule() {
        let mut set = RuleSet::new();
        set.add_marker("START").unwrap();
        assert_eq!(set.marker_prev_index("START", 1), Some(-1));
        set.add_rule(rule_with_id(1, 1)).unwrap();
        set.remove_by_id(&[(1, 1)]).unwrap();
        assert_eq!(set.marker_prev_index("START", 1), Some(-1));
    }

    #[test]
    fn test_tx_slots_case_fold() {
        let mut set = RuleSet::new();
        let a = set.tx_slot("Score", true).unwrap();
        let b = set.tx_slot("SCORE", true).unwrap();
        assert_eq!(a, b);
        assert_eq!(set.tx_slot_name(a), Some("score"));
        assert_eq!(set.tx_slot_count(), 1);
    }

    #[test]
    fn test_skip_after_resolution() {
        let mut set = RuleSet::new();
        let mut jumper = rule_with_id(6, 1);
        jumper.skip_after = "END".to_string();
        set.add_rule(jumper).unwrap();
        set.add_rule(rule_with_id(7, 1)).unwrap();
        set.add_marker("END").unwrap();
        set.init();

        assert_eq!(set.rules_by_phase[0][0].skip, 1);
        assert!(set.is_frozen());
    }

    #[test]
    fn test_frozen_set_rejects_mutation() {
        let mut set = RuleSet::new();
        set.init();
        assert!(set.add_rule(rule_with_id(1, 1)).is_err());
        assert!(set.tx_slot("late", true).is_none());
    }
}
