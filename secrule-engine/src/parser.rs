//! Directive-language front end.
//!
//! A line-oriented parser for the ModSecurity-compatible configuration
//! language: backslash continuations, `#` comments, quoted arguments,
//! `Include` resolution relative to the including file, and the directive
//! set of the configuration surface. The output is the compiled rule model;
//! errors point back to `file:line:column` and abort the load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::action::{Action, ActionKind, Ctl, MacroText, ResolvedRules, SetVarOp, SetVarTarget};
use crate::config::{
    AuditEngine, AuditLogConfig, AuditLogFormat, AuditLogType, BodyLimitAction, BodyProcessor,
    EngineOption,
};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::expansion::Expansion;
use crate::operator::{Operator, OperatorCtx};
use crate::pattern;
use crate::rule::{Disruptive, Rule, Severity};
use crate::transform::Transform;
use crate::variable::{SubName, Variable, VariableKind};

pub struct Parser<'e> {
    engine: &'e mut Engine,
    /// Rule waiting for its chained child (`chain` action seen).
    pending_chain: Option<Rule>,
}

impl<'e> Parser<'e> {
    pub fn new(engine: &'e mut Engine) -> Self {
        Parser {
            engine,
            pending_chain: None,
        }
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        self.load_str(&text, &path.display().to_string())
    }

    pub fn load_str(&mut self, text: &str, file: &str) -> Result<()> {
        let file_arc: Arc<str> = Arc::from(file);
        let mut pending_line = String::new();
        let mut pending_start = 0usize;

        for (number, raw_line) in text.lines().enumerate() {
            let line_number = number + 1;
            let line = raw_line.trim();

            if pending_line.is_empty() {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                pending_start = line_number;
            }

            if let Some(continued) = line.strip_suffix('\\') {
                pending_line.push_str(continued.trim_end());
                pending_line.push(' ');
                continue;
            }

            pending_line.push_str(line);
            let directive = std::mem::take(&mut pending_line);
            self.parse_directive(&directive, &file_arc, pending_start)?;
        }

        if !pending_line.is_empty() {
            self.parse_directive(&pending_line, &file_arc, pending_start)?;
        }

        if self.pending_chain.is_some() {
            // a trailing chain is resolved by the next load call; only init
            // treats it as fatal
            debug!(file = file, "chain action still open at end of input");
        }
        Ok(())
    }

    fn parse_directive(&mut self, directive: &str, file: &Arc<str>, line: usize) -> Result<()> {
        let tokens = tokenize(directive)
            .map_err(|msg| EngineError::at(file, line, 1, msg))?;
        let Some((name, args)) = tokens.split_first() else {
            return Ok(());
        };

        // a chained rule may only be followed by SecRule
        if self.pending_chain.is_some() && name.as_str() != "SecRule" {
            return Err(EngineError::at(
                file,
                line,
                1,
                format!("expected chained SecRule, found {name}"),
            ));
        }

        match name.as_str() {
            "SecRule" => self.parse_sec_rule(args, file, line),
            "SecAction" => self.parse_sec_action(args, file, line),
            "SecDefaultAction" => self.parse_sec_default_action(args, file, line),
            "SecMarker" => {
                let marker = one_arg(args, file, line, "SecMarker")?;
                self.engine.ruleset_mut().add_marker(&marker)
            }
            "Include" => {
                let target = one_arg(args, file, line, "Include")?;
                let path = resolve_include(file, &target);
                debug!(path = %path.display(), "Include");
                self.load_file(&path)
            }
            "SecRuleRemoveById" => {
                let ids = parse_id_ranges(args, file, line)?;
                self.engine.ruleset_mut().remove_by_id(&ids).map(|_| ())
            }
            "SecRuleRemoveByMsg" => {
                let msg = one_arg(args, file, line, "SecRuleRemoveByMsg")?;
                self.engine.ruleset_mut().remove_by_msg(&msg).map(|_| ())
            }
            "SecRuleRemoveByTag" => {
                let tag = one_arg(args, file, line, "SecRuleRemoveByTag")?;
                self.engine.ruleset_mut().remove_by_tag(&tag).map(|_| ())
            }
            "SecRuleUpdateActionById" => self.update_action_by_id(args, file, line),
            "SecRuleUpdateTargetById" => self.update_target(args, file, line, TargetSelector::Id),
            "SecRuleUpdateTargetByMsg" => self.update_target(args, file, line, TargetSelector::Msg),
            "SecRuleUpdateTargetByTag" => self.update_target(args, file, line, TargetSelector::Tag),
            "SecRuleUpdateOperatorById" => {
                self.update_operator(args, file, line, TargetSelector::Id)
            }
            "SecRuleUpdateOperatorByTag" => {
                self.update_operator(args, file, line, TargetSelector::Tag)
            }
            _ => self.parse_config_directive(name, args, file, line),
        }
    }

    // ---- Configuration directives ---------------------------------------

    fn parse_config_directive(
        &mut self,
        name: &str,
        args: &[String],
        file: &Arc<str>,
        line: usize,
    ) -> Result<()> {
        let arg = |index: usize| -> Result<&str> {
            args.get(index).map(String::as_str).ok_or_else(|| {
                EngineError::at(file, line, 1, format!("{name} is missing an argument"))
            })
        };
        let int_arg = |index: usize| -> Result<u64> {
            arg(index)?.parse::<u64>().map_err(|_| {
                EngineError::at(file, line, 1, format!("{name} expects a number"))
            })
        };

        let config = self.engine.config_mut();
        match name {
            "SecRuleEngine" => config.rule_engine = EngineOption::parse(arg(0)?)?,
            "SecRequestBodyAccess" => config.request_body_access = EngineOption::parse(arg(0)?)?,
            "SecResponseBodyAccess" => config.response_body_access = EngineOption::parse(arg(0)?)?,
            "SecRequestBodyLimit" => config.request_body_limit = int_arg(0)?,
            "SecRequestBodyNoFilesLimit" => config.request_body_no_files_limit = int_arg(0)?,
            "SecRequestBodyJsonDepthLimit" => config.request_body_json_depth_limit = int_arg(0)?,
            "SecResponseBodyLimit" => config.response_body_limit = int_arg(0)?,
            "SecRequestBodyLimitAction" => {
                config.request_body_limit_action = BodyLimitAction::parse(arg(0)?)?
            }
            "SecResponseBodyLimitAction" => {
                config.response_body_limit_action = BodyLimitAction::parse(arg(0)?)?
            }
            "SecResponseBodyMimeType" => {
                for mime in args {
                    config.response_body_mime_types.push(mime.clone());
                }
            }
            "SecResponseBodyMimeTypesClear" => config.response_body_mime_types.clear(),
            "SecArgumentsLimit" => config.arguments_limit = int_arg(0)? as u32,
            "SecArgumentSeparator" => {
                let separator = arg(0)?;
                config.argument_separator = separator.chars().next().ok_or_else(|| {
                    EngineError::at(file, line, 1, "SecArgumentSeparator needs a character")
                })?;
            }
            "SecUploadFileLimit" => config.upload_file_limit = int_arg(0)? as u32,
            "SecUnicodeMapFile" => {
                let path = resolve_include(file, arg(0)?);
                let code_point = int_arg(1)? as u32;
                config.load_unicode_map(&path, code_point)?;
            }
            "SecPcreMatchLimit" => config.pcre_match_limit = int_arg(0)? as u32,
            "SecPmfSerializeDir" => config.pmf_serialize_dir = arg(0)?.to_string(),
            "SecComponentSignature" => {}
            _ => {
                return self.parse_audit_directive(name, args, file, line);
            }
        }
        Ok(())
    }

    fn parse_audit_directive(
        &mut self,
        name: &str,
        args: &[String],
        file: &Arc<str>,
        line: usize,
    ) -> Result<()> {
        let arg = |index: usize| -> Result<&str> {
            args.get(index).map(String::as_str).ok_or_else(|| {
                EngineError::at(file, line, 1, format!("{name} is missing an argument"))
            })
        };

        let audit: &mut AuditLogConfig = self.engine.audit_config_mut();
        match name {
            "SecAuditEngine" => {
                audit.engine = match arg(0)? {
                    s if s.eq_ignore_ascii_case("on") => AuditEngine::On,
                    s if s.eq_ignore_ascii_case("off") => AuditEngine::Off,
                    s if s.eq_ignore_ascii_case("relevantonly") => AuditEngine::RelevantOnly,
                    other => {
                        return Err(EngineError::at(
                            file,
                            line,
                            1,
                            format!("invalid SecAuditEngine value '{other}'"),
                        ))
                    }
                }
            }
            "SecAuditLog" => audit.log_path = arg(0)?.to_string(),
            "SecAuditLog2" => audit.log_path2 = arg(0)?.to_string(),
            "SecAuditLogStorageDir" => audit.storage_dir = arg(0)?.to_string(),
            "SecAuditLogDirMode" => {
                audit.dir_mode = u32::from_str_radix(arg(0)?, 8)
                    .map_err(|_| EngineError::at(file, line, 1, "invalid octal mode"))?
            }
            "SecAuditLogFileMode" => {
                audit.file_mode = u32::from_str_radix(arg(0)?, 8)
                    .map_err(|_| EngineError::at(file, line, 1, "invalid octal mode"))?
            }
            "SecAuditLogFormat" => {
                audit.format = match arg(0)? {
                    s if s.eq_ignore_ascii_case("json") => AuditLogFormat::Json,
                    s if s.eq_ignore_ascii_case("native") => AuditLogFormat::Native,
                    other => {
                        return Err(EngineError::at(
                            file,
                            line,
                            1,
                            format!("invalid SecAuditLogFormat value '{other}'"),
                        ))
                    }
                }
            }
            "SecAuditLogParts" => audit.log_parts = AuditLogConfig::parse_parts(arg(0)?)?,
            "SecAuditLogRelevantStatus" => audit.relevant_status = arg(0)?.to_string(),
            "SecAuditLogType" => {
                audit.log_type = match arg(0)? {
                    s if s.eq_ignore_ascii_case("serial") => AuditLogType::Serial,
                    s if s.eq_ignore_ascii_case("concurrent") => AuditLogType::Concurrent,
                    s if s.eq_ignore_ascii_case("https") => AuditLogType::Https,
                    other => {
                        return Err(EngineError::at(
                            file,
                            line,
                            1,
                            format!("invalid SecAuditLogType value '{other}'"),
                        ))
                    }
                }
            }
            _ => {
                return Err(EngineError::at(
                    file,
                    line,
                    1,
                    format!("unknown directive '{name}'"),
                ));
            }
        }
        Ok(())
    }

    // ---- Rules -----------------------------------------------------------

    fn parse_sec_rule(&mut self, args: &[String], file: &Arc<str>, line: usize) -> Result<()> {
        if args.len() < 2 {
            return Err(EngineError::at(
                file,
                line,
                1,
                "SecRule needs targets and an operator",
            ));
        }

        let mut rule = Rule::new(file.clone(), line);
        let chaining = self.pending_chain.is_some();
        if chaining {
            // phase and chain position come from the parent
            let parent = self.pending_chain.as_ref().unwrap();
            let deepest = deepest_rule(parent);
            rule.phase = deepest.phase;
            rule.chain_index = deepest.chain_index + 1;
        }

        self.parse_targets(&mut rule, &args[0], file, line)?;

        let (op_name, op_arg, negated) = split_operator(&args[1]);
        let ctx = self.operator_ctx(file);
        rule.operator = Some(
            Operator::new(op_name, op_arg, negated, &ctx)
                .map_err(|e| EngineError::at(file, line, 1, e.to_string()))?,
        );

        let mut flags = ActionFlags::default();
        if let Some(actions) = args.get(2) {
            self.parse_actions(&mut rule, actions, file, line, &mut flags)?;
        }
        if flags.capture {
            if let Some(op) = rule.operator.as_mut() {
                op.capture = true;
            }
        }
        if chaining && flags.phase_set {
            return Err(EngineError::at(
                file,
                line,
                1,
                "chained rules inherit the phase of the chain starter",
            ));
        }

        self.finish_rule(rule, flags.chain, chaining)
    }

    fn parse_sec_action(&mut self, args: &[String], file: &Arc<str>, line: usize) -> Result<()> {
        let actions = one_arg(args, file, line, "SecAction")?;
        let mut rule = Rule::new(file.clone(), line);
        let mut flags = ActionFlags::default();
        self.parse_actions(&mut rule, &actions, file, line, &mut flags)?;
        if flags.unmatched_branch {
            return Err(EngineError::at(
                file,
                line,
                1,
                "branch-conditional actions are only legal inside SecRule",
            ));
        }
        self.finish_rule(rule, flags.chain, false)
    }

    fn parse_sec_default_action(
        &mut self,
        args: &[String],
        file: &Arc<str>,
        line: usize,
    ) -> Result<()> {
        let actions = one_arg(args, file, line, "SecDefaultAction")?;
        let mut rule = Rule::new(file.clone(), line);
        let mut flags = ActionFlags::default();
        self.parse_actions(&mut rule, &actions, file, line, &mut flags)?;
        if !flags.phase_set {
            return Err(EngineError::at(
                file,
                line,
                1,
                "SecDefaultAction requires an explicit phase",
            ));
        }
        if flags.chain {
            return Err(EngineError::at(file, line, 1, "SecDefaultAction cannot chain"));
        }
        self.engine.ruleset_mut().set_default_action(rule)
    }

    fn finish_rule(&mut self, rule: Rule, opens_chain: bool, is_chained: bool) -> Result<()> {
        if is_chained {
            let mut parent = self.pending_chain.take().unwrap();
            attach_chain(&mut parent, rule);
            if opens_chain {
                self.pending_chain = Some(parent);
                return Ok(());
            }
            return self.engine.ruleset_mut().add_rule(parent);
        }

        if opens_chain {
            self.pending_chain = Some(rule);
            return Ok(());
        }
        self.engine.ruleset_mut().add_rule(rule)
    }

    // ---- Targets ---------------------------------------------------------

    fn parse_targets(
        &mut self,
        rule: &mut Rule,
        targets: &str,
        file: &Arc<str>,
        line: usize,
    ) -> Result<()> {
        for target in targets.split('|') {
            let target = target.trim();
            if target.is_empty() {
                continue;
            }
            let variable = self
                .parse_target(target, file)
                .map_err(|e| EngineError::at(file, line, 1, e.to_string()))?;
            rule.append_variable(variable);
        }
        if rule.variables.is_empty() && rule.except_variables.is_empty() {
            return Err(EngineError::at(file, line, 1, "SecRule has no targets"));
        }
        Ok(())
    }

    fn parse_target(&mut self, target: &str, file: &Arc<str>) -> Result<Variable> {
        let mut rest = target;
        let is_not = rest.starts_with('!');
        if is_not {
            rest = &rest[1..];
        }
        let is_counter = rest.starts_with('&');
        if is_counter {
            rest = &rest[1..];
        }

        let (main, sub) = match rest.split_once(':') {
            Some((main, sub)) => (main, sub),
            None => (rest, ""),
        };
        let kind = VariableKind::from_name(main)
            .ok_or_else(|| EngineError::Parse(format!("unknown variable '{main}'")))?;

        let sub = sub.trim_matches('\'');
        let sub_name = if sub.is_empty() {
            SubName::None
        } else if sub.len() >= 2 && sub.starts_with('/') && sub.ends_with('/') {
            let source = sub.to_string();
            let pattern = pattern::intern(
                &sub[1..sub.len() - 1],
                false,
                self.engine.config().pcre_match_limit,
            )?;
            SubName::Regex { source, pattern }
        } else if sub.len() >= 2 && sub.starts_with('@') && sub.ends_with('@') {
            let source = sub.to_string();
            let path = resolve_include(file, &sub[1..sub.len() - 1]);
            let set = pattern::intern_file(
                &path,
                &self.engine.config().pmf_serialize_dir,
                self.engine.config().pcre_match_limit,
            )?;
            SubName::File { source, set }
        } else {
            // register literal TX keys in the interned slot table
            if kind == VariableKind::Tx && sub.parse::<usize>().is_err() {
                self.engine.ruleset_mut().tx_slot(sub, true);
            }
            SubName::Literal(sub.to_ascii_lowercase())
        };

        Ok(Variable::new(kind, sub_name, is_not, is_counter))
    }

    // ---- Actions ---------------------------------------------------------

    fn parse_actions(
        &mut self,
        rule: &mut Rule,
        actions: &str,
        file: &Arc<str>,
        line: usize,
        flags: &mut ActionFlags,
    ) -> Result<()> {
        for item in split_actions(actions) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            self.parse_action(rule, item, flags).map_err(|e| match e {
                EngineError::Parse(msg) if !msg.starts_with(file.as_ref()) => {
                    EngineError::at(file, line, 1, msg)
                }
                other => other,
            })?;
        }
        Ok(())
    }

    fn parse_action(&mut self, rule: &mut Rule, item: &str, flags: &mut ActionFlags) -> Result<()> {
        let (key, value) = match item.split_once(':') {
            Some((key, value)) => (key.trim(), unquote(value.trim())),
            None => (item, String::new()),
        };

        match key {
            // meta-data
            "id" => {
                rule.id = value
                    .parse()
                    .map_err(|_| EngineError::Parse(format!("invalid rule id '{value}'")))?
            }
            "phase" => {
                rule.phase = parse_phase(&value)?;
                flags.phase_set = true;
            }
            "msg" => rule.msg = Some(MacroText::parse(&value)),
            "tag" => rule.tags.push(Arc::from(value.as_str())),
            "rev" => rule.rev = value,
            "ver" => rule.ver = value,
            "accuracy" => {
                rule.accuracy = value
                    .parse()
                    .map_err(|_| EngineError::Parse(format!("invalid accuracy '{value}'")))?
            }
            "maturity" => {
                rule.maturity = value
                    .parse()
                    .map_err(|_| EngineError::Parse(format!("invalid maturity '{value}'")))?
            }
            "severity" => {
                rule.severity = Some(Severity::parse(&value).ok_or_else(|| {
                    EngineError::Parse(format!("invalid severity '{value}'"))
                })?)
            }

            // non-disruptive flags
            "log" => rule.log = Some(true),
            "nolog" | "noLog" => rule.log = Some(false),
            "auditlog" | "auditLog" => rule.audit_log = Some(true),
            "noauditlog" | "noAuditLog" => rule.audit_log = Some(false),
            "logdata" => rule.log_data = Some(MacroText::parse(&value)),
            "capture" => flags.capture = true,
            "multiMatch" | "multimatch" => rule.multi_match = true,
            "t" => {
                if value == "none" {
                    rule.transforms.clear();
                    rule.ignore_default_transforms = true;
                } else {
                    rule.transforms.push(Transform::from_name(&value).ok_or_else(
                        || EngineError::Parse(format!("unknown transformation 't:{value}'")),
                    )?);
                }
            }

            // flow
            "chain" => flags.chain = true,
            "skip" => {
                rule.skip = value
                    .parse()
                    .map_err(|_| EngineError::Parse(format!("invalid skip '{value}'")))?
            }
            "skipAfter" | "skipafter" => rule.skip_after = value,

            // disruptive
            "allow" => {
                rule.disruptive = match value.as_str() {
                    "" => Disruptive::Allow,
                    "phase" => Disruptive::AllowPhase,
                    "request" => Disruptive::AllowRequest,
                    other => {
                        return Err(EngineError::Parse(format!(
                            "invalid allow granularity '{other}'"
                        )))
                    }
                }
            }
            "block" => rule.disruptive = Disruptive::Block,
            "deny" => rule.disruptive = Disruptive::Deny,
            "drop" => rule.disruptive = Disruptive::Drop,
            "pass" => rule.disruptive = Disruptive::Pass,
            "redirect" => {
                rule.disruptive = Disruptive::Redirect;
                rule.redirect = value;
                rule.status = 302;
            }
            "status" => {
                rule.status = value
                    .parse()
                    .map_err(|_| EngineError::Parse(format!("invalid status '{value}'")))?
            }

            // runtime actions
            "setvar" => rule.actions.push(self.parse_setvar(&value)?),
            "setenv" => {
                let (name, value) = split_assignment(&value);
                rule.actions.push(Action::new(ActionKind::SetEnv {
                    key: MacroText::parse(name),
                    value: MacroText::parse(value),
                }));
            }
            "setuid" => rule
                .actions
                .push(Action::new(ActionKind::SetUid(MacroText::parse(&value)))),
            "setsid" => rule
                .actions
                .push(Action::new(ActionKind::SetSid(MacroText::parse(&value)))),
            "setrsc" => rule
                .actions
                .push(Action::new(ActionKind::SetRsc(MacroText::parse(&value)))),
            "initcol" => {
                let (collection, key) = split_assignment(&value);
                if collection.is_empty() || key.is_empty() {
                    return Err(EngineError::Parse(format!(
                        "invalid initcol '{value}'"
                    )));
                }
                rule.actions.push(Action::new(ActionKind::InitCol {
                    collection: collection.to_uppercase(),
                    key: MacroText::parse(key),
                }));
            }
            "ctl" => rule.actions.push(self.parse_ctl(&value)?),

            _ => {
                return Err(EngineError::Parse(format!("unknown action '{key}'")));
            }
        }
        Ok(())
    }

    fn parse_setvar(&mut self, value: &str) -> Result<Action> {
        let mut rest = value;
        let removing = rest.starts_with('!');
        if removing {
            rest = &rest[1..];
        }

        let (target_text, value_text) = split_assignment(rest);
        let (collection, key) = target_text.split_once('.').ok_or_else(|| {
            EngineError::Parse(format!("setvar target '{target_text}' needs collection.key"))
        })?;

        let key_macro = Expansion::contains_macro(key);
        let slot = if !key_macro && collection.eq_ignore_ascii_case("tx") {
            self.engine.ruleset_mut().tx_slot(key, true)
        } else {
            None
        };
        let target = SetVarTarget {
            collection: collection.to_ascii_lowercase(),
            key: MacroText::parse(key),
            slot,
        };

        let (op, value_text) = if removing {
            (SetVarOp::Remove, "")
        } else if value_text.is_empty() && !rest.contains('=') {
            (SetVarOp::Create, "")
        } else if let Some(stripped) = value_text.strip_prefix('+') {
            (SetVarOp::Increase, stripped)
        } else if let Some(stripped) = value_text.strip_prefix('-') {
            (SetVarOp::Decrease, stripped)
        } else {
            (SetVarOp::CreateAndInit, value_text)
        };

        Ok(Action::new(ActionKind::SetVar {
            target,
            value: MacroText::parse(value_text),
            op,
        }))
    }

    fn parse_ctl(&mut self, value: &str) -> Result<Action> {
        let (key, argument) = split_assignment(value);
        let ctl = match key {
            "auditEngine" => Ctl::AuditEngine(match argument {
                a if a.eq_ignore_ascii_case("on") => AuditEngine::On,
                a if a.eq_ignore_ascii_case("off") => AuditEngine::Off,
                a if a.eq_ignore_ascii_case("relevantonly") => AuditEngine::RelevantOnly,
                other => {
                    return Err(EngineError::Parse(format!(
                        "invalid ctl:auditEngine value '{other}'"
                    )))
                }
            }),
            "auditLogParts" => Ctl::AuditLogParts(AuditLogConfig::parse_parts(argument)?),
            "requestBodyAccess" => {
                Ctl::RequestBodyAccess(argument.eq_ignore_ascii_case("on"))
            }
            "requestBodyProcessor" => Ctl::RequestBodyProcessor(BodyProcessor::parse(argument)?),
            "ruleEngine" => Ctl::RuleEngine(EngineOption::parse(argument)?),
            "ruleRemoveById" => match argument.split_once('-') {
                Some((lo, hi)) => Ctl::RuleRemoveByIdRange(
                    lo.trim().parse().map_err(|_| bad_ctl(argument))?,
                    hi.trim().parse().map_err(|_| bad_ctl(argument))?,
                ),
                None => Ctl::RuleRemoveById(argument.parse().map_err(|_| bad_ctl(argument))?),
            },
            "ruleRemoveByTag" => Ctl::RuleRemoveByTag(argument.to_string()),
            "ruleRemoveTargetById" => {
                let (id, target) = argument.split_once(';').ok_or_else(|| bad_ctl(argument))?;
                let (main, sub) = split_target_name(target);
                Ctl::RuleRemoveTargetById {
                    id: id.trim().parse().map_err(|_| bad_ctl(argument))?,
                    main,
                    sub,
                }
            }
            "ruleRemoveTargetByTag" => {
                let (tag, target) = argument.split_once(';').ok_or_else(|| bad_ctl(argument))?;
                let (main, sub) = split_target_name(target);
                Ctl::RuleRemoveTargetByTag {
                    tag: tag.trim().to_string(),
                    main,
                    sub,
                }
            }
            other => {
                return Err(EngineError::Parse(format!("unknown ctl option '{other}'")));
            }
        };
        Ok(Action::new(ActionKind::Ctl {
            ctl,
            resolved: ResolvedRules::default(),
        }))
    }

    // ---- Post-hoc rule edits ---------------------------------------------

    fn update_action_by_id(&mut self, args: &[String], file: &Arc<str>, line: usize) -> Result<()> {
        if args.len() != 2 {
            return Err(EngineError::at(
                file,
                line,
                1,
                "SecRuleUpdateActionById needs an id and an action list",
            ));
        }
        let id: u64 = args[0]
            .parse()
            .map_err(|_| EngineError::at(file, line, 1, "invalid rule id"))?;

        let mut patch = Rule::new(file.clone(), line);
        let mut flags = ActionFlags::default();
        let actions = args[1].clone();
        self.parse_actions(&mut patch, &actions, file, line, &mut flags)?;

        let Some(rule) = self.engine.ruleset_mut().rule_mut_by_id(id) else {
            warn!(id, "SecRuleUpdateActionById: rule not found");
            return Ok(());
        };
        merge_rule_patch(rule, patch, &flags);
        Ok(())
    }

    fn update_target(
        &mut self,
        args: &[String],
        file: &Arc<str>,
        line: usize,
        selector: TargetSelector,
    ) -> Result<()> {
        if args.len() != 2 {
            return Err(EngineError::at(
                file,
                line,
                1,
                "rule target update needs a selector and a target list",
            ));
        }
        let targets = args[1].clone();
        let positions = self.select_rules(&args[0], selector, file, line)?;

        let mut variables = Vec::new();
        for target in targets.split('|') {
            let target = target.trim();
            if !target.is_empty() {
                variables.push(
                    self.parse_target(target, file)
                        .map_err(|e| EngineError::at(file, line, 1, e.to_string()))?,
                );
            }
        }

        for (phase, index) in positions {
            if let Some(rule) =
                self.engine.ruleset_mut().rules_by_phase[phase as usize - 1].get_mut(index)
            {
                for variable in &variables {
                    rule.append_variable(variable.clone());
                }
            }
        }
        Ok(())
    }

    fn update_operator(
        &mut self,
        args: &[String],
        file: &Arc<str>,
        line: usize,
        selector: TargetSelector,
    ) -> Result<()> {
        if args.len() != 2 {
            return Err(EngineError::at(
                file,
                line,
                1,
                "rule operator update needs a selector and an operator",
            ));
        }
        let positions = self.select_rules(&args[0], selector, file, line)?;
        let operator_text = args[1].clone();
        let (op_name, op_arg, negated) = split_operator(&operator_text);
        let ctx = self.operator_ctx(file);
        // validate the operator text even when the selector matches nothing
        Operator::new(op_name, op_arg, negated, &ctx)
            .map_err(|e| EngineError::at(file, line, 1, e.to_string()))?;

        // operators carry compiled payloads and are not Clone; rebuild one
        // per selected rule (compilations are interned, so this is cheap)
        for (phase, index) in positions {
            let operator = Operator::new(op_name, op_arg, negated, &ctx)
                .map_err(|e| EngineError::at(file, line, 1, e.to_string()))?;
            if let Some(rule) =
                self.engine.ruleset_mut().rules_by_phase[phase as usize - 1].get_mut(index)
            {
                rule.operator = Some(operator);
            }
        }
        Ok(())
    }

    fn select_rules(
        &mut self,
        selector_value: &str,
        selector: TargetSelector,
        file: &Arc<str>,
        line: usize,
    ) -> Result<Vec<(u8, usize)>> {
        Ok(match selector {
            TargetSelector::Id => {
                let id: u64 = selector_value
                    .parse()
                    .map_err(|_| EngineError::at(file, line, 1, "invalid rule id"))?;
                self.engine
                    .ruleset()
                    .find_rule(id)
                    .map(|rule| vec![(rule.phase, rule.index as usize)])
                    .unwrap_or_default()
            }
            TargetSelector::Msg => self.engine.ruleset().rules_by_msg(selector_value),
            TargetSelector::Tag => self.engine.ruleset().rules_by_tag(selector_value),
        })
    }

    fn operator_ctx(&self, file: &Arc<str>) -> OperatorCtx {
        let rule_dir = Path::new(file.as_ref())
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        OperatorCtx {
            rule_dir,
            pmf_serialize_dir: self.engine.config().pmf_serialize_dir.clone(),
            step_limit: self.engine.config().pcre_match_limit,
        }
    }
}

#[derive(Clone, Copy)]
enum TargetSelector {
    Id,
    Msg,
    Tag,
}

#[derive(Default)]
struct ActionFlags {
    chain: bool,
    capture: bool,
    phase_set: bool,
    unmatched_branch: bool,
}

fn deepest_rule(rule: &Rule) -> &Rule {
    let mut cursor = rule;
    while let Some(chain) = cursor.chain.as_deref() {
        cursor = chain;
    }
    cursor
}

fn attach_chain(parent: &mut Rule, child: Rule) {
    let mut cursor = parent;
    while cursor.chain.is_some() {
        cursor = cursor.chain.as_deref_mut().unwrap();
    }
    let slot = cursor.append_chain_rule(child.line);
    let phase = slot.phase;
    let chain_index = slot.chain_index;
    *slot = child;
    slot.phase = phase;
    slot.chain_index = chain_index;
}

fn merge_rule_patch(rule: &mut Rule, patch: Rule, flags: &ActionFlags) {
    if patch.severity.is_some() {
        rule.severity = patch.severity;
    }
    if patch.msg.is_some() {
        rule.msg = patch.msg;
    }
    if patch.log_data.is_some() {
        rule.log_data = patch.log_data;
    }
    if patch.log.is_some() {
        rule.log = patch.log;
    }
    if patch.audit_log.is_some() {
        rule.audit_log = patch.audit_log;
    }
    if patch.disruptive != Disruptive::Pass {
        rule.disruptive = patch.disruptive;
        rule.redirect = patch.redirect;
    }
    if patch.status != 403 {
        rule.status = patch.status;
    }
    if !patch.transforms.is_empty() || patch.ignore_default_transforms {
        rule.transforms = patch.transforms;
        rule.ignore_default_transforms = patch.ignore_default_transforms;
    }
    rule.tags.extend(patch.tags);
    rule.actions.extend(patch.actions);
    if flags.capture {
        if let Some(op) = rule.operator.as_mut() {
            op.capture = true;
        }
    }
}

fn parse_phase(value: &str) -> Result<u8> {
    let phase: u8 = match value {
        "request" => 2,
        "response" => 4,
        "logging" => 5,
        other => other
            .parse()
            .map_err(|_| EngineError::Parse(format!("invalid phase '{other}'")))?,
    };
    if !(1..=5).contains(&phase) {
        return Err(EngineError::Parse(format!("phase {phase} out of range")));
    }
    Ok(phase)
}

fn bad_ctl(argument: &str) -> EngineError {
    EngineError::Parse(format!("invalid ctl argument '{argument}'"))
}

/// `NAME`, `NAME:sub` or `NAME.sub` into upper main plus folded sub.
fn split_target_name(target: &str) -> (String, String) {
    let target = target.trim();
    match target.split_once([':', '.']) {
        Some((main, sub)) => (main.to_uppercase(), sub.to_ascii_lowercase()),
        None => (target.to_uppercase(), String::new()),
    }
}

fn split_assignment(text: &str) -> (&str, &str) {
    match text.split_once('=') {
        Some((key, value)) => (key.trim(), value.trim()),
        None => (text.trim(), ""),
    }
}

/// Split `"@name arg"` / `"!@name arg"` / bare-pattern operator text.
fn split_operator(text: &str) -> (&str, &str, bool) {
    let mut rest = text;
    let negated = rest.starts_with('!');
    if negated {
        rest = &rest[1..];
    }
    match rest.strip_prefix('@') {
        Some(with_name) => match with_name.split_once(' ') {
            Some((name, arg)) => (name, arg.trim(), negated),
            None => (with_name, "", negated),
        },
        // the default operator is rx
        None => ("rx", rest, negated),
    }
}

fn one_arg(args: &[String], file: &Arc<str>, line: usize, directive: &str) -> Result<String> {
    match args {
        [only] => Ok(only.clone()),
        _ => Err(EngineError::at(
            file,
            line,
            1,
            format!("{directive} expects exactly one argument"),
        )),
    }
}

fn parse_id_ranges(args: &[String], file: &Arc<str>, line: usize) -> Result<Vec<(u64, u64)>> {
    let mut ranges = Vec::new();
    for arg in args {
        match arg.split_once('-') {
            Some((lo, hi)) => ranges.push((
                lo.trim()
                    .parse()
                    .map_err(|_| EngineError::at(file, line, 1, "invalid id range"))?,
                hi.trim()
                    .parse()
                    .map_err(|_| EngineError::at(file, line, 1, "invalid id range"))?,
            )),
            None => {
                let id: u64 = arg
                    .parse()
                    .map_err(|_| EngineError::at(file, line, 1, "invalid rule id"))?;
                ranges.push((id, id));
            }
        }
    }
    if ranges.is_empty() {
        return Err(EngineError::at(file, line, 1, "no rule ids given"));
    }
    Ok(ranges)
}

fn resolve_include(including_file: &str, target: &str) -> PathBuf {
    let path = Path::new(target);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match Path::new(including_file).parent() {
        Some(dir) if !dir.as_os_str().is_empty() && including_file != "<inline>" => {
            dir.join(path)
        }
        _ => path.to_path_buf(),
    }
}

/// Split a directive into whitespace-separated arguments with double-quote
/// grouping and backslash escapes inside quotes.
fn tokenize(directive: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = directive.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(std::mem::take(&mut current));
                    in_quotes = false;
                } else {
                    in_quotes = true;
                }
            }
            '\\' if in_quotes => match chars.next() {
                Some('"') => current.push('"'),
                Some('\\') => current.push('\\'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => return Err("dangling backslash".to_string()),
            },
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Split an action list on commas, honouring single-quoted values.
fn split_actions(actions: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = actions.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("\\'", "'")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quoted() {
        let tokens =
            tokenize(r#"SecRule ARGS "@contains evil" "id:1,phase:2,deny""#).unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[2], "@contains evil");
        assert_eq!(tokens[3], "id:1,phase:2,deny");
    }

    #[test]
    fn test_tokenize_escapes() {
        let tokens = tokenize(r#"SecRule ARGS "@rx a\"b""#).unwrap();
        assert_eq!(tokens[2], "@rx a\"b");
        assert!(tokenize(r#"SecRule ARGS "unterminated"#).is_err());
    }

    #[test]
    fn test_split_operator_forms() {
        assert_eq!(split_operator("@contains evil"), ("contains", "evil", false));
        assert_eq!(split_operator("!@streq x"), ("streq", "x", true));
        assert_eq!(split_operator("^foo$"), ("rx", "^foo$", false));
        assert_eq!(split_operator("!bad"), ("rx", "bad", true));
    }

    #[test]
    fn test_split_actions_respects_quotes() {
        let items = split_actions("id:1,msg:'a, quoted, msg',deny");
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], "msg:'a, quoted, msg'");
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote(r"'don\'t'"), "don't");
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(parse_phase("1").unwrap(), 1);
        assert_eq!(parse_phase("request").unwrap(), 2);
        assert_eq!(parse_phase("logging").unwrap(), 5);
        assert!(parse_phase("7").is_err());
    }

    #[test]
    fn test_split_target_name() {
        assert_eq!(
            split_target_name("ARGS:token"),
            ("ARGS".to_string(), "token".to_string())
        );
        assert_eq!(split_target_name("args"), ("ARGS".to_string(), String::new()));
    }
}
