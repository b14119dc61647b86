//! Per-request evaluation state and the phase driver.
//!
//! A transaction is created after engine init, used for exactly one HTTP
//! exchange, and dropped after phase 5. The host feeds it connection and
//! request-line data, header and body extractor closures, and receives
//! `true` (continue) or `false` (intervention) from every `process_*` call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use metrics::counter;
use rand::Rng;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::action::{ResolvedRules, SetVarOp};
use crate::config::{AuditEngine, BodyLimitAction, BodyProcessor, EngineOption, PHASE_TOTAL};
use crate::engine::Engine;
use crate::rule::{Disruptive, Rule};
use crate::transform::Transform;
use crate::variable::{Element, FullName, Variable};
use crate::variant::Variant;

/// Extra TX slots reserved for names first seen at request time (macro
/// `setvar` keys). Growing past this budget is ignored in release builds.
const LOCAL_TX_SLOT_BUDGET: usize = 100;

const MAX_CAPTURES: usize = 10;

/// Finds one request/response header by lower-cased name.
pub type HeaderFind<'t> = Box<dyn Fn(&str) -> Option<&'t str> + 't>;
/// Visits every header as `(lower-cased name, value)`; the visitor returns
/// `false` to stop early.
pub type HeaderTraverse<'t> = Box<dyn Fn(&mut dyn FnMut(&str, &str) -> bool) + 't>;
/// Returns the buffered body bytes. The buffer is host-owned and must stay
/// valid for the transaction's lifetime.
pub type BodyExtract<'t> = Box<dyn Fn() -> &'t [u8] + 't>;
/// Invoked synchronously for every matched top-level rule whose `log`
/// resolves true.
pub type LogCallback<'t> = Box<dyn FnMut(&Rule) + 't>;
/// Optional host veto consulted after a positive operator match.
pub type AdditionalCondition<'t> = Box<dyn Fn(&Rule, &str) -> bool + 't>;

/// Host-side HTTP extraction closures.
#[derive(Default)]
pub struct HttpExtractor<'t> {
    pub request_header_find: Option<HeaderFind<'t>>,
    pub request_header_traverse: Option<HeaderTraverse<'t>>,
    pub request_header_count: usize,
    pub response_header_find: Option<HeaderFind<'t>>,
    pub response_header_traverse: Option<HeaderTraverse<'t>>,
    pub response_header_count: usize,
    pub request_body: Option<BodyExtract<'t>>,
    pub response_body: Option<BodyExtract<'t>>,
}

/// Parsed request line.
#[derive(Debug, Clone)]
pub struct RequestLineInfo {
    pub line: Arc<str>,
    pub method: Arc<str>,
    /// URI with the query string stripped.
    pub uri: Arc<str>,
    pub uri_raw: Arc<str>,
    /// URI relative to the host (scheme and authority stripped).
    pub relative_path: Arc<str>,
    pub query: Arc<str>,
    pub protocol: Arc<str>,
    pub version: Arc<str>,
}

impl Default for RequestLineInfo {
    fn default() -> Self {
        let empty: Arc<str> = Arc::from("");
        RequestLineInfo {
            line: empty.clone(),
            method: empty.clone(),
            uri: empty.clone(),
            uri_raw: empty.clone(),
            relative_path: empty.clone(),
            query: empty.clone(),
            protocol: empty.clone(),
            version: empty,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseLineInfo {
    pub status: Arc<str>,
    pub protocol: Arc<str>,
}

impl ResponseLineInfo {
    fn new() -> Self {
        ResponseLineInfo {
            status: Arc::from(""),
            protocol: Arc::from(""),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub downstream_ip: Arc<str>,
    pub downstream_port: u16,
    pub upstream_ip: Arc<str>,
    pub upstream_port: u16,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            downstream_ip: Arc::from(""),
            downstream_port: 0,
            upstream_ip: Arc::from(""),
            upstream_port: 0,
        }
    }
}

/// One uploaded file from a multipart body.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: Arc<str>,
    pub filename: Arc<str>,
    pub size: u64,
}

/// A recorded match, consumed by the host's log sink.
#[derive(Debug, Clone)]
pub struct MatchedVariable {
    pub full_name: FullName,
    pub value: Variant,
    pub transformed: Variant,
    pub capture: Option<Variant>,
    pub transforms: Vec<Transform>,
    pub chain_index: i32,
}

/// Why a `process_*` call returned `false`, for host introspection.
#[derive(Debug, Clone)]
pub struct Intervention {
    pub rule_id: u64,
    pub phase: u8,
    pub status: u16,
    pub redirect: Option<String>,
}

/// Per-transaction configuration overrides installed by the `ctl` action.
#[derive(Debug, Clone, Default)]
pub struct TransactionOverrides {
    pub rule_engine: Option<EngineOption>,
    pub audit_engine: Option<AuditEngine>,
    pub audit_log_parts: Option<u32>,
    pub request_body_access: Option<bool>,
}

/// Per-request evaluation state. Single-threaded; the host owns it and must
/// not share it across threads while in use.
pub struct Transaction<'t> {
    engine: &'t Engine,

    pub request_line: RequestLineInfo,
    pub response_line: ResponseLineInfo,
    pub connection: ConnectionInfo,

    /// Query parameters in parse order.
    pub query_args: Vec<(Arc<str>, Arc<str>)>,
    /// Body parameters in parse order, filled by the body processor.
    pub body_args: Vec<(Arc<str>, Arc<str>)>,
    pub files: Vec<FileInfo>,
    pub multipart_part_headers: Vec<(Arc<str>, Arc<str>)>,
    pub cookies: Vec<(Arc<str>, Arc<str>)>,
    cookies_init: bool,

    pub request_body: Option<Arc<str>>,
    pub response_body: Option<Arc<str>>,
    pub body_processor: Option<BodyProcessor>,
    pub reqbody_error: bool,
    pub reqbody_processor_error: bool,
    pub multipart_strict_error: bool,

    extractor: HttpExtractor<'t>,
    log_callback: Option<LogCallback<'t>>,
    additional_condition: Option<AdditionalCondition<'t>>,

    // TX variable slots: engine-interned slots first, then the local budget
    tx_variables: Vec<Variant>,
    engine_slot_count: usize,
    local_tx_index: HashMap<String, usize>,

    captures: SmallVec<[Variant; MAX_CAPTURES]>,
    staged_captures: SmallVec<[Variant; MAX_CAPTURES]>,

    /// Matched records per chain level; level 0 is the top-level rule.
    matched_variables: Vec<Vec<MatchedVariable>>,

    transform_cache: HashMap<(usize, Transform), Option<Variant>>,
    transform_cache_misses: u64,

    rule_remove_flags: [Vec<bool>; PHASE_TOTAL],
    rule_target_removed: HashSet<(u8, i32, String, String)>,

    pub current_phase: u8,
    pub current_rule_index: usize,
    pub overrides: TransactionOverrides,

    pub msg_expanded: Option<String>,
    pub log_data_expanded: Option<String>,
    pub intervention: Option<Intervention>,

    /// Persistent collection keys installed by initcol / setsid / setuid.
    collection_keys: HashMap<String, String>,
    pub geo: Vec<(Arc<str>, Arc<str>)>,
    pub session_id: Arc<str>,
    pub user_id: Arc<str>,

    unique_id: Option<Arc<str>>,
    pub created_at: DateTime<Local>,
    started: Instant,
    full_request_cache: Option<Arc<str>>,

    /// Phases at or below this bound are skipped (allow family).
    allow_below_phase: u8,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(engine: &'t Engine) -> Self {
        let engine_slot_count = engine.ruleset().tx_slot_count();
        let mut tx_variables = Vec::with_capacity(engine_slot_count + LOCAL_TX_SLOT_BUDGET);
        tx_variables.resize(engine_slot_count, Variant::Empty);

        Transaction {
            engine,
            request_line: RequestLineInfo::default(),
            response_line: ResponseLineInfo::new(),
            connection: ConnectionInfo::default(),
            query_args: Vec::new(),
            body_args: Vec::new(),
            files: Vec::new(),
            multipart_part_headers: Vec::new(),
            cookies: Vec::new(),
            cookies_init: false,
            request_body: None,
            response_body: None,
            body_processor: None,
            reqbody_error: false,
            reqbody_processor_error: false,
            multipart_strict_error: false,
            extractor: HttpExtractor::default(),
            log_callback: None,
            additional_condition: None,
            tx_variables,
            engine_slot_count,
            local_tx_index: HashMap::new(),
            captures: SmallVec::new(),
            staged_captures: SmallVec::new(),
            matched_variables: Vec::new(),
            transform_cache: HashMap::with_capacity(64),
            transform_cache_misses: 0,
            rule_remove_flags: Default::default(),
            rule_target_removed: HashSet::new(),
            current_phase: 0,
            current_rule_index: 0,
            overrides: TransactionOverrides::default(),
            msg_expanded: None,
            log_data_expanded: None,
            intervention: None,
            collection_keys: HashMap::new(),
            geo: Vec::new(),
            session_id: Arc::from(""),
            user_id: Arc::from(""),
            unique_id: None,
            created_at: Local::now(),
            started: Instant::now(),
            full_request_cache: None,
            allow_below_phase: 0,
        }
    }

    pub fn engine(&self) -> &'t Engine {
        self.engine
    }

    /// Install the optional host veto callback.
    pub fn set_additional_condition(&mut self, cond: AdditionalCondition<'t>) {
        self.additional_condition = Some(cond);
    }

    // ---- Host API: connection and request line --------------------------

    pub fn process_connection(
        &mut self,
        downstream_ip: &str,
        downstream_port: u16,
        upstream_ip: &str,
        upstream_port: u16,
    ) {
        trace!("==== process connection ====");
        self.connection = ConnectionInfo {
            downstream_ip: Arc::from(downstream_ip),
            downstream_port,
            upstream_ip: Arc::from(upstream_ip),
            upstream_port,
        };
    }

    /// Parse a full request line, e.g. `GET /index.html?a=b HTTP/1.1`.
    pub fn process_uri_line(&mut self, request_line: &str) {
        trace!("==== process uri ====");
        let mut parts = request_line.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let uri_raw = parts.next().unwrap_or("");
        let proto_version = parts.next().unwrap_or("");
        let (protocol, version) = match proto_version.split_once('/') {
            Some((p, v)) => (p, v),
            None => (proto_version, ""),
        };
        self.set_request_line(request_line, method, uri_raw, protocol, version);
    }

    /// Pre-split form: the request line is reassembled for REQUEST_LINE.
    pub fn process_uri(&mut self, uri: &str, method: &str, version: &str) {
        trace!("==== process uri ====");
        let line = format!("{method} {uri} HTTP/{version}");
        self.set_request_line(&line, method, uri, "HTTP", version);
    }

    fn set_request_line(
        &mut self,
        line: &str,
        method: &str,
        uri_raw: &str,
        protocol: &str,
        version: &str,
    ) {
        let (path, query) = match uri_raw.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri_raw, ""),
        };

        let relative = ["http://", "https://"]
            .iter()
            .find_map(|scheme| {
                path.strip_prefix(scheme)
                    .map(|rest| rest.find('/').map(|pos| &rest[pos..]).unwrap_or(""))
            })
            .unwrap_or(path);

        self.request_line = RequestLineInfo {
            line: Arc::from(line),
            method: Arc::from(method),
            uri: Arc::from(path),
            uri_raw: Arc::from(uri_raw),
            relative_path: Arc::from(relative),
            query: Arc::from(query),
            protocol: Arc::from(protocol),
            version: Arc::from(version),
        };

        self.query_args = parse_urlencoded(
            query,
            self.engine.config().argument_separator,
            self.engine.config().arguments_limit,
        );
        debug!(
            method = method,
            uri = path,
            query = query,
            args = self.query_args.len(),
            "Parsed request line"
        );
    }

    // ---- Host API: phases ------------------------------------------------

    pub fn process_request_headers(
        &mut self,
        find: HeaderFind<'t>,
        traverse: HeaderTraverse<'t>,
        header_count: usize,
        log_callback: LogCallback<'t>,
    ) -> bool {
        trace!("==== process request headers ====");
        self.extractor.request_header_find = Some(find);
        self.extractor.request_header_traverse = Some(traverse);
        self.extractor.request_header_count = header_count;
        self.log_callback = Some(log_callback);

        // pick the request body processor from the declared content type;
        // JSON and XML must be selected explicitly with ctl
        if let Some(find) = self.extractor.request_header_find.as_ref() {
            if let Some(content_type) = find("content-type") {
                let content_type = content_type
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase();
                self.body_processor = match content_type.as_str() {
                    "application/x-www-form-urlencoded" => Some(BodyProcessor::UrlEncoded),
                    "multipart/form-data" => Some(BodyProcessor::MultiPart),
                    _ => None,
                };
            }
        }

        self.process(1)
    }

    pub fn process_request_body(
        &mut self,
        body: BodyExtract<'t>,
        log_callback: LogCallback<'t>,
    ) -> bool {
        trace!("==== process request body ====");
        self.extractor.request_body = Some(body);
        self.log_callback = Some(log_callback);

        let access = self
            .overrides
            .request_body_access
            .unwrap_or(self.engine.config().request_body_access == EngineOption::On);
        if access {
            if !self.buffer_request_body() {
                return false;
            }
            self.run_body_processor();
        }

        self.process(2)
    }

    pub fn process_response_headers(
        &mut self,
        status_code: &str,
        protocol: &str,
        find: HeaderFind<'t>,
        traverse: HeaderTraverse<'t>,
        header_count: usize,
        log_callback: LogCallback<'t>,
    ) -> bool {
        trace!("==== process response headers ====");
        self.extractor.response_header_find = Some(find);
        self.extractor.response_header_traverse = Some(traverse);
        self.extractor.response_header_count = header_count;
        self.log_callback = Some(log_callback);
        self.response_line = ResponseLineInfo {
            status: Arc::from(status_code),
            protocol: Arc::from(protocol),
        };
        self.process(3)
    }

    pub fn process_response_body(
        &mut self,
        body: BodyExtract<'t>,
        log_callback: LogCallback<'t>,
    ) -> bool {
        trace!("==== process response body ====");
        self.extractor.response_body = Some(body);
        self.log_callback = Some(log_callback);

        let mime_buffered = match self
            .extractor
            .response_header_find
            .as_ref()
            .and_then(|find| find("content-type"))
        {
            Some(content_type) => {
                let content_type = content_type.split(';').next().unwrap_or("").trim();
                self.engine
                    .config()
                    .response_body_mime_types
                    .iter()
                    .any(|mime| mime.eq_ignore_ascii_case(content_type))
            }
            None => true,
        };

        if self.engine.config().response_body_access == EngineOption::On && mime_buffered {
            let raw = self.extractor.response_body.as_ref().map(|f| f());
            if let Some(raw) = raw {
                let limit = self.engine.config().response_body_limit as usize;
                let clipped = if raw.len() > limit {
                    if self.engine.config().response_body_limit_action == BodyLimitAction::Reject {
                        self.intervention = Some(Intervention {
                            rule_id: 0,
                            phase: 4,
                            status: 500,
                            redirect: None,
                        });
                        return false;
                    }
                    &raw[..limit]
                } else {
                    raw
                };
                self.response_body = Some(Arc::from(String::from_utf8_lossy(clipped).as_ref()));
            }
        }

        self.process(4)
    }

    /// Phase 5 (logging). Always continues; the return mirrors the other
    /// phases for interface symmetry.
    pub fn process_logging(&mut self, log_callback: LogCallback<'t>) -> bool {
        trace!("==== process logging ====");
        self.log_callback = Some(log_callback);
        self.process(5)
    }

    fn buffer_request_body(&mut self) -> bool {
        let raw = match self.extractor.request_body.as_ref() {
            Some(f) => f(),
            None => return true,
        };
        let limit = self.engine.config().request_body_limit as usize;
        let clipped = if raw.len() > limit {
            if self.engine.config().request_body_limit_action == BodyLimitAction::Reject {
                warn!(size = raw.len(), limit, "Request body over limit, rejecting");
                self.intervention = Some(Intervention {
                    rule_id: 0,
                    phase: 2,
                    status: 413,
                    redirect: None,
                });
                return false;
            }
            self.reqbody_error = true;
            &raw[..limit]
        } else {
            raw
        };
        self.request_body = Some(Arc::from(String::from_utf8_lossy(clipped).as_ref()));
        true
    }

    fn run_body_processor(&mut self) {
        let Some(body) = self.request_body.clone() else {
            return;
        };
        match self.body_processor {
            Some(BodyProcessor::UrlEncoded) => {
                let separator = self.engine.config().argument_separator;
                let limit = self.engine.config().arguments_limit;
                self.body_args = parse_urlencoded(&body, separator, limit);
            }
            Some(BodyProcessor::MultiPart) => {
                let content_type = self
                    .extractor
                    .request_header_find
                    .as_ref()
                    .and_then(|find| find("content-type"))
                    .unwrap_or("")
                    .to_string();
                self.parse_multipart(&content_type, &body);
            }
            Some(BodyProcessor::Json) => {
                let depth_limit = self.engine.config().request_body_json_depth_limit;
                match serde_json::from_str::<serde_json::Value>(&body) {
                    Ok(value) => {
                        let mut args = Vec::new();
                        flatten_json(&value, "json", 0, depth_limit, &mut args);
                        self.body_args = args;
                    }
                    Err(e) => {
                        warn!(error = %e, "JSON body failed to parse");
                        self.reqbody_processor_error = true;
                    }
                }
            }
            Some(BodyProcessor::Xml) => {
                // XML parsing is a host collaborator; its absence is an error
                self.reqbody_processor_error = true;
            }
            None => {}
        }
    }

    fn parse_multipart(&mut self, content_type: &str, body: &str) {
        let Some(boundary) = content_type
            .split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("boundary="))
            .map(|b| b.trim_matches('"'))
        else {
            self.multipart_strict_error = true;
            self.reqbody_processor_error = true;
            return;
        };
        let delimiter = format!("--{boundary}");
        let file_limit = self.engine.config().upload_file_limit;

        for part in body.split(delimiter.as_str()).skip(1) {
            let part = part.trim_start_matches("\r\n");
            if part.starts_with("--") || part.is_empty() {
                break;
            }
            let Some((head, data)) = part.split_once("\r\n\r\n") else {
                self.multipart_strict_error = true;
                continue;
            };
            let data = data.strip_suffix("\r\n").unwrap_or(data);

            let mut name = "";
            let mut filename = None;
            for line in head.lines() {
                let Some((header, value)) = line.split_once(':') else {
                    continue;
                };
                let header_key: Arc<str> = Arc::from(header.trim().to_ascii_lowercase());
                self.multipart_part_headers
                    .push((header_key.clone(), Arc::from(value.trim())));
                if header.eq_ignore_ascii_case("content-disposition") {
                    for attr in value.split(';').map(str::trim) {
                        if let Some(v) = attr.strip_prefix("name=") {
                            name = v.trim_matches('"');
                        } else if let Some(v) = attr.strip_prefix("filename=") {
                            filename = Some(v.trim_matches('"'));
                        }
                    }
                }
            }

            match filename {
                Some(filename) => {
                    if file_limit > 0 && self.files.len() >= file_limit as usize {
                        self.multipart_strict_error = true;
                        continue;
                    }
                    self.files.push(FileInfo {
                        name: Arc::from(name),
                        filename: Arc::from(filename),
                        size: data.len() as u64,
                    });
                }
                None => {
                    self.body_args.push((Arc::from(name), Arc::from(data)));
                }
            }
        }
    }

    // ---- Phase driver ----------------------------------------------------

    fn process(&mut self, phase: u8) -> bool {
        let engine = self.engine;
        let rule_engine = self
            .overrides
            .rule_engine
            .unwrap_or(engine.config().rule_engine);
        if rule_engine == EngineOption::Off {
            return true;
        }
        let detection_only = rule_engine == EngineOption::DetectionOnly;

        self.current_phase = phase;
        if phase <= self.allow_below_phase {
            trace!(phase, "phase allowed through by a prior allow action");
            return true;
        }

        let rules = engine.ruleset().rules_by_phase[phase as usize - 1].as_slice();
        let default_action = engine.ruleset().default_actions[phase as usize - 1].as_ref();

        let mut i = 0usize;
        while i < rules.len() {
            self.current_rule_index = i;

            let flags = &self.rule_remove_flags[phase as usize - 1];
            if !flags.is_empty() && flags[i] {
                i += 1;
                continue;
            }

            // per-rule state: captures, matched records, expanded macros
            self.captures.clear();
            self.staged_captures.clear();
            for level in self.matched_variables.iter_mut() {
                level.clear();
            }
            self.msg_expanded = None;
            self.log_data_expanded = None;

            let rule = &rules[i];
            let is_matched = rule.evaluate(self, default_action);

            // SecAction rules never log or disrupt from the driver
            if !is_matched || rule.operator.is_none() {
                i += 1;
                continue;
            }

            counter!("secrule_rules_matched", 1);

            let log_enabled = rule
                .log
                .or(default_action.and_then(|d| d.log))
                .unwrap_or(true);
            if log_enabled {
                if let Some(callback) = self.log_callback.as_mut() {
                    callback(rule);
                }
            }

            if let Some(verdict) = self.resolve_disruptive(rule, default_action, detection_only) {
                return verdict;
            }

            if rule.skip > 0 {
                i += rule.skip as usize + 1;
                continue;
            }
            if !rule.skip_after.is_empty() {
                if let Some(prev) = engine.ruleset().marker_prev_index(&rule.skip_after, phase) {
                    if prev > i as i32 {
                        i = prev as usize + 1;
                        continue;
                    }
                }
            }

            i += 1;
        }

        true
    }

    /// The disruptive resolution table. `Some(true)` ends the phase and
    /// continues the transaction, `Some(false)` is an intervention, `None`
    /// falls through to the next rule.
    fn resolve_disruptive(
        &mut self,
        rule: &Rule,
        default_action: Option<&Rule>,
        detection_only: bool,
    ) -> Option<bool> {
        let effective = match rule.disruptive {
            Disruptive::Block => default_action
                .map(|d| d.disruptive)
                .unwrap_or(Disruptive::Pass),
            other => other,
        };

        let verdict = match effective {
            Disruptive::Allow => {
                // a rule's own allow ends the later phases too; a Block that
                // resolved to a default-action allow only ends this phase
                if rule.disruptive == Disruptive::Allow {
                    self.allow_below_phase = PHASE_TOTAL as u8;
                }
                Some(true)
            }
            Disruptive::AllowPhase => Some(true),
            Disruptive::AllowRequest => {
                self.allow_below_phase = 2;
                Some(true)
            }
            Disruptive::Deny | Disruptive::Drop => {
                self.intervention = Some(Intervention {
                    rule_id: rule.id,
                    phase: self.current_phase,
                    status: rule.status,
                    redirect: None,
                });
                Some(false)
            }
            Disruptive::Redirect => {
                let target = if effective == rule.disruptive {
                    rule.redirect.clone()
                } else {
                    default_action
                        .map(|d| d.redirect.clone())
                        .unwrap_or_default()
                };
                self.intervention = Some(Intervention {
                    rule_id: rule.id,
                    phase: self.current_phase,
                    status: rule.status,
                    redirect: Some(target),
                });
                Some(false)
            }
            Disruptive::Block | Disruptive::Pass => None,
        };

        match verdict {
            Some(false) if detection_only => {
                debug!(
                    rule_id = rule.id,
                    "DetectionOnly: intervention suppressed"
                );
                self.intervention = None;
                None
            }
            Some(false) => {
                counter!("secrule_interventions", 1);
                debug!(rule_id = rule.id, phase = self.current_phase, "Intervention");
                verdict
            }
            other => other,
        }
    }

    // ---- Header and body access -----------------------------------------

    pub fn request_headers(&self) -> Vec<(Arc<str>, Arc<str>)> {
        collect_headers(self.extractor.request_header_traverse.as_ref())
    }

    pub fn response_headers(&self) -> Vec<(Arc<str>, Arc<str>)> {
        collect_headers(self.extractor.response_header_traverse.as_ref())
    }

    pub fn request_header(&self, lower_case_key: &str) -> Option<&'t str> {
        self.extractor
            .request_header_find
            .as_ref()
            .and_then(|find| find(lower_case_key))
    }

    /// Lazily parse the Cookie header. Names keep parse order.
    pub fn ensure_cookies(&mut self) {
        if self.cookies_init {
            return;
        }
        self.cookies_init = true;
        let Some(cookies) = self.request_header("cookie") else {
            return;
        };
        for cookie in cookies.split(';') {
            let cookie = cookie.trim();
            if let Some((name, value)) = cookie.split_once('=') {
                self.cookies.push((Arc::from(name), Arc::from(value)));
            }
        }
    }

    /// The reassembled full request (line, headers, body), built lazily.
    pub fn full_request(&mut self) -> Arc<str> {
        if let Some(cached) = &self.full_request_cache {
            return cached.clone();
        }
        let mut text = String::new();
        text.push_str(&self.request_line.line);
        text.push_str("\r\n");
        for (name, value) in self.request_headers() {
            text.push_str(&name);
            text.push_str(": ");
            text.push_str(&value);
            text.push_str("\r\n");
        }
        text.push_str("\r\n");
        if let Some(body) = &self.request_body {
            text.push_str(body);
        }
        let built: Arc<str> = Arc::from(text);
        self.full_request_cache = Some(built.clone());
        built
    }

    // ---- TX variable slots ----------------------------------------------

    fn slot_for(&mut self, name: &str, create: bool) -> Option<usize> {
        if let Some(slot) = self.engine.ruleset().tx_slot_lookup(name) {
            return Some(slot);
        }
        let folded = name.to_ascii_lowercase();
        if let Some(&slot) = self.local_tx_index.get(&folded) {
            return Some(slot);
        }
        if !create {
            return None;
        }
        if self.local_tx_index.len() >= LOCAL_TX_SLOT_BUDGET {
            debug_assert!(false, "local TX slot budget exhausted");
            warn!(name = %folded, "Local TX slot budget exhausted, setvar ignored");
            return None;
        }
        let slot = self.tx_variables.len();
        self.tx_variables.push(Variant::Empty);
        self.local_tx_index.insert(folded, slot);
        Some(slot)
    }

    pub fn set_tx_variable_by_slot(&mut self, slot: usize, value: Variant) {
        if let Some(entry) = self.tx_variables.get_mut(slot) {
            *entry = value;
        }
    }

    pub fn set_tx_variable(&mut self, name: &str, value: Variant) {
        if let Some(slot) = self.slot_for(name, true) {
            self.set_tx_variable_by_slot(slot, value);
        }
    }

    pub fn remove_tx_variable_by_slot(&mut self, slot: usize) {
        if let Some(entry) = self.tx_variables.get_mut(slot) {
            *entry = Variant::Empty;
        }
    }

    pub fn remove_tx_variable(&mut self, name: &str) {
        if let Some(slot) = self.slot_for(name, false) {
            self.remove_tx_variable_by_slot(slot);
        }
    }

    pub fn increase_tx_variable_by_slot(&mut self, slot: usize, delta: i64) {
        if let Some(entry) = self.tx_variables.get_mut(slot) {
            let current = entry.to_int_lossy();
            *entry = Variant::Int(current + delta);
        }
    }

    pub fn increase_tx_variable(&mut self, name: &str, delta: i64) {
        if let Some(slot) = self.slot_for(name, true) {
            self.increase_tx_variable_by_slot(slot, delta);
        }
    }

    pub fn get_tx_variable(&self, name: &str) -> Variant {
        let slot = self
            .engine
            .ruleset()
            .tx_slot_lookup(name)
            .or_else(|| self.local_tx_index.get(&name.to_ascii_lowercase()).copied());
        slot.and_then(|s| self.tx_variables.get(s))
            .cloned()
            .unwrap_or(Variant::Empty)
    }

    /// All non-empty TX variables as `(name, value)`, engine slots first.
    pub fn tx_variables_snapshot(&self) -> Vec<(Arc<str>, Variant)> {
        let mut snapshot = Vec::new();
        for (slot, value) in self.tx_variables.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let name = if slot < self.engine_slot_count {
                self.engine.ruleset().tx_slot_name(slot).map(Arc::from)
            } else {
                self.local_tx_index
                    .iter()
                    .find(|(_, &s)| s == slot)
                    .map(|(name, _)| Arc::from(name.as_str()))
            };
            if let Some(name) = name {
                snapshot.push((name, value.clone()));
            }
        }
        snapshot
    }

    // ---- Captures --------------------------------------------------------

    /// Stage a capture while an operator evaluates. Overflow past TX:9 is
    /// dropped.
    pub fn stage_capture(&mut self, index: usize, value: Variant) {
        if index >= MAX_CAPTURES {
            return;
        }
        if self.staged_captures.len() <= index {
            self.staged_captures.resize(index + 1, Variant::Empty);
        }
        self.staged_captures[index] = value;
    }

    /// Commit the staging area into TX:0..TX:9 after a positive match.
    pub fn merge_staged_captures(&mut self) -> usize {
        if self.staged_captures.is_empty() {
            return 0;
        }
        self.captures = std::mem::take(&mut self.staged_captures);
        self.captures.len()
    }

    pub fn clear_staged_captures(&mut self) {
        self.staged_captures.clear();
    }

    pub fn capture(&self, index: usize) -> Variant {
        match self.captures.get(index) {
            Some(value) => value.clone(),
            None => {
                trace!(index, size = self.captures.len(), "capture index out of range");
                Variant::Empty
            }
        }
    }

    // ---- Matched records -------------------------------------------------

    pub fn push_matched_variable(
        &mut self,
        var: &Variable,
        chain_index: i32,
        element: Element,
        transformed: Variant,
        transforms: Vec<Transform>,
    ) {
        let level = (chain_index + 1) as usize;
        while self.matched_variables.len() <= level {
            self.matched_variables.push(Vec::new());
        }
        let mut full_name = var.full_name();
        if let Some(sub) = &element.sub_name {
            full_name.sub = sub.to_string();
        }
        self.matched_variables[level].push(MatchedVariable {
            full_name,
            value: element.value,
            transformed,
            capture: self.captures.first().cloned(),
            transforms,
            chain_index,
        });
    }

    /// Records visible to a rule at `chain_index`: its parent's level for
    /// chained rules, its own for top-level rules.
    pub fn matched_level(&self, chain_index: i32) -> &[MatchedVariable] {
        let level = chain_index.max(0) as usize;
        self.matched_variables
            .get(level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All top-level matched records (for the host's audit sink).
    pub fn matched_variables(&self) -> &[MatchedVariable] {
        self.matched_level(-1)
    }

    // ---- Transform cache -------------------------------------------------

    /// Run `transform` over `input` through the per-transaction cache.
    /// Returns `None` when the transform reports "no change" (cached too).
    pub fn apply_transform_cached(&mut self, input: &Variant, transform: Transform) -> Option<Variant> {
        let pointer = input.str_ptr()?;
        let key = (pointer, transform);
        if let Some(cached) = self.transform_cache.get(&key) {
            trace!(transform = transform.name(), "transform cache hit");
            return cached.clone();
        }

        self.transform_cache_misses += 1;
        let subject = input.as_str()?;
        let mut output = String::new();
        let changed = transform.evaluate(subject, &mut output, self.engine.config());
        let result = if changed {
            Some(if transform.converts_to_int() {
                Variant::Int(output.parse::<i64>().unwrap_or(0))
            } else {
                Variant::from(output)
            })
        } else {
            None
        };
        self.transform_cache.insert(key, result.clone());
        result
    }

    pub fn transform_cache_misses(&self) -> u64 {
        self.transform_cache_misses
    }

    // ---- ctl runtime ------------------------------------------------------

    /// Flag rules for per-transaction removal. Rules that already ran are
    /// left untouched: only indices strictly ahead of the current one count
    /// in the current phase.
    pub fn remove_rules(&mut self, resolved: &ResolvedRules) {
        let engine = self.engine;
        for phase in self.current_phase.max(1)..=PHASE_TOTAL as u8 {
            let targets = &resolved.by_phase[phase as usize - 1];
            if targets.is_empty() {
                continue;
            }
            let rule_count = engine.ruleset().rules_by_phase[phase as usize - 1].len();
            let flags = &mut self.rule_remove_flags[phase as usize - 1];
            if flags.is_empty() {
                flags.resize(rule_count, false);
            }
            for &index in targets {
                if phase == self.current_phase && index <= self.current_rule_index {
                    continue;
                }
                if index < flags.len() {
                    flags[index] = true;
                }
            }
        }
    }

    pub fn remove_rule_targets(&mut self, resolved: &ResolvedRules, main: &str, sub: &str) {
        for phase in 1..=PHASE_TOTAL as u8 {
            for &index in &resolved.by_phase[phase as usize - 1] {
                self.rule_target_removed.insert((
                    phase,
                    index as i32,
                    main.to_ascii_uppercase(),
                    sub.to_ascii_lowercase(),
                ));
            }
        }
    }

    /// Consulted during collection iteration; only top-level rules can have
    /// targets removed.
    pub fn is_rule_target_removed(&self, rule: &Rule, main: &str, key: &str) -> bool {
        if rule.chain_index != -1 || self.rule_target_removed.is_empty() {
            return false;
        }
        let main = main.to_ascii_uppercase();
        let whole = (rule.phase, rule.index, main.clone(), String::new());
        if self.rule_target_removed.contains(&whole) {
            return true;
        }
        let exact = (rule.phase, rule.index, main, key.to_ascii_lowercase());
        self.rule_target_removed.contains(&exact)
    }

    // ---- Persistent collections and host callbacks -----------------------

    pub fn set_collection_key(&mut self, collection: &'static str, key: String) {
        if collection == "SESSION" {
            self.session_id = Arc::from(key.as_str());
        } else if collection == "USER" {
            self.user_id = Arc::from(key.as_str());
        }
        self.collection_keys.insert(collection.to_string(), key);
    }

    pub fn set_collection_key_owned(&mut self, collection: String, key: String) {
        self.collection_keys.insert(collection.to_uppercase(), key);
    }

    pub fn collection_key(&self, collection: &str) -> Option<&str> {
        self.collection_keys.get(collection).map(String::as_str)
    }

    pub fn persistent_entries(&self, collection: &str) -> Option<Vec<(Arc<str>, Arc<str>)>> {
        let store = self.engine.persistent_store()?;
        let key = self.collection_keys.get(collection)?;
        Some(
            store
                .entries(collection, key)
                .into_iter()
                .map(|(k, v)| (Arc::from(k), Arc::from(v)))
                .collect(),
        )
    }

    pub fn persistent_put(&mut self, collection: &str, name: &str, value: String, op: SetVarOp) {
        let collection = collection.to_uppercase();
        let Some(store) = self.engine.persistent_store() else {
            warn!(collection = %collection, "setvar on persistent collection without a store");
            return;
        };
        let key = self
            .collection_keys
            .get(&collection)
            .cloned()
            .unwrap_or_default();
        match op {
            SetVarOp::Remove => store.remove(&collection, &key, name),
            SetVarOp::Create => store.put(&collection, &key, name, "1"),
            SetVarOp::CreateAndInit => store.put(&collection, &key, name, &value),
            SetVarOp::Increase | SetVarOp::Decrease => {
                let current = store
                    .entries(&collection, &key)
                    .into_iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| Variant::from(v).to_int_lossy())
                    .unwrap_or(0);
                let mut delta = Variant::from(value).to_int_lossy();
                if op == SetVarOp::Decrease {
                    delta = -delta;
                }
                store.put(&collection, &key, name, &(current + delta).to_string());
            }
        }
    }

    pub fn host_geo_lookup(&mut self, operand: &Variant) -> bool {
        let Some(ip) = operand.as_str() else {
            return false;
        };
        let Some(lookup) = self.engine.callbacks().geo_lookup.as_ref() else {
            warn!("geoLookup without a host resolver");
            return false;
        };
        match lookup(ip) {
            Some(entries) => {
                self.geo = entries
                    .into_iter()
                    .map(|(k, v)| (Arc::from(k), Arc::from(v)))
                    .collect();
                true
            }
            None => false,
        }
    }

    pub fn host_inspect_file(&mut self, operand: &Variant, argument: &str) -> bool {
        let Some(path) = operand.as_str() else {
            return false;
        };
        match self.engine.callbacks().inspect_file.as_ref() {
            Some(inspect) => inspect(path, argument),
            None => {
                warn!("inspectFile without a host inspector");
                false
            }
        }
    }

    pub fn host_fuzzy_hash(&mut self, operand: &Variant, argument: &str) -> bool {
        let Some(subject) = operand.as_str() else {
            return false;
        };
        match self.engine.callbacks().fuzzy_hash.as_ref() {
            Some(hash) => hash(subject, argument),
            None => {
                warn!("fuzzyHash without a host hasher");
                false
            }
        }
    }

    pub fn host_rbl(&mut self, operand: &Variant, argument: &str) -> bool {
        let Some(subject) = operand.as_str() else {
            return false;
        };
        match self.engine.callbacks().rbl.as_ref() {
            Some(rbl) => rbl(subject, argument),
            None => {
                warn!("rbl without a host resolver");
                false
            }
        }
    }

    pub fn host_validate_dtd(&mut self, operand: &Variant, argument: &str) -> bool {
        let Some(subject) = operand.as_str() else {
            return false;
        };
        match self.engine.callbacks().validate_dtd.as_ref() {
            Some(validate) => validate(subject, argument),
            None => {
                warn!("validateDTD without an XML collaborator");
                false
            }
        }
    }

    pub fn host_validate_schema(&mut self, operand: &Variant, argument: &str) -> bool {
        let Some(subject) = operand.as_str() else {
            return false;
        };
        match self.engine.callbacks().validate_schema.as_ref() {
            Some(validate) => validate(subject, argument),
            None => {
                warn!("validateSchema without an XML collaborator");
                false
            }
        }
    }

    pub fn additional_condition_holds(&mut self, rule: &Rule, subject: &str) -> bool {
        match self.additional_condition.as_ref() {
            Some(cond) => cond(rule, subject),
            None => true,
        }
    }

    // ---- Identity and timing ----------------------------------------------

    /// Lazily generated `<millis>.<6-digit-random>` transaction id.
    pub fn unique_id(&mut self) -> Arc<str> {
        if let Some(id) = &self.unique_id {
            return id.clone();
        }
        let millis = self.created_at.timestamp_millis();
        let random: u32 = rand::thread_rng().gen_range(100_000..200_000);
        let id: Arc<str> = Arc::from(format!("{millis}.{random}"));
        self.unique_id = Some(id.clone());
        id
    }

    pub fn duration_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

fn collect_headers(
    traverse: Option<&HeaderTraverse<'_>>,
) -> Vec<(Arc<str>, Arc<str>)> {
    let mut headers = Vec::new();
    if let Some(traverse) = traverse {
        traverse(&mut |name, value| {
            headers.push((Arc::from(name), Arc::from(value)));
            true
        });
    }
    headers
}

/// Split and percent-decode an urlencoded parameter string.
fn parse_urlencoded(input: &str, separator: char, limit: u32) -> Vec<(Arc<str>, Arc<str>)> {
    let mut args = Vec::new();
    if input.is_empty() {
        return args;
    }
    for pair in input.split(separator) {
        if limit > 0 && args.len() >= limit as usize {
            warn!(limit, "SecArgumentsLimit reached, remaining arguments dropped");
            break;
        }
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        };
        args.push((
            Arc::from(percent_decode(name)),
            Arc::from(percent_decode(value)),
        ));
    }
    args
}

/// Flatten scalar JSON leaves into dotted-path arguments
/// (`json.user.name=...`), stopping at the configured depth.
fn flatten_json(
    value: &serde_json::Value,
    path: &str,
    depth: u64,
    depth_limit: u64,
    out: &mut Vec<(Arc<str>, Arc<str>)>,
) {
    if depth_limit > 0 && depth > depth_limit {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                flatten_json(child, &format!("{path}.{key}"), depth + 1, depth_limit, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_json(child, &format!("{path}.{index}"), depth + 1, depth_limit, out);
            }
        }
        serde_json::Value::Null => {}
        serde_json::Value::String(s) => out.push((Arc::from(path), Arc::from(s.as_str()))),
        other => out.push((Arc::from(path), Arc::from(other.to_string()))),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hi = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (bytes[i + 2] as char).to_digit(16).unwrap_or(0) as u8;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn test_parse_urlencoded_order_and_limit() {
        let args = parse_urlencoded("b=2&a=1&c", '&', 0);
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].0.as_ref(), "b");
        assert_eq!(args[2].1.as_ref(), "");

        let limited = parse_urlencoded("a=1&b=2&c=3", '&', 2);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_parse_urlencoded_custom_separator() {
        let args = parse_urlencoded("a=1;b=2", ';', 0);
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].0.as_ref(), "b");
    }
}
