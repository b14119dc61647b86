//! Variable nodes: extraction of `(sub-name, value)` pairs from a
//! transaction.
//!
//! Each node is a `(kind, sub-name)` pair plus the `!` / `&` modifiers from
//! the rule language. Collection kinds expand to many pairs; the sub-name
//! narrows them by literal key, `/regex/`, or `@file@` pattern set. Exception
//! sub-names attached by rule finalisation (from `!ARGS:name` entries and
//! `SecRuleUpdateTargetBy*`) are filtered out during iteration.

use std::collections::HashSet;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::pattern::{MultiPattern, Pattern};
use crate::rule::Rule;
use crate::transaction::Transaction;
use crate::variant::Variant;

/// One extracted value.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub value: Variant,
    /// Key of the collection entry this value came from, when any.
    pub sub_name: Option<Arc<str>>,
}

impl Element {
    pub fn new(value: impl Into<Variant>) -> Self {
        Element {
            value: value.into(),
            sub_name: None,
        }
    }

    pub fn keyed(key: Arc<str>, value: impl Into<Variant>) -> Self {
        Element {
            value: value.into(),
            sub_name: Some(key),
        }
    }
}

/// Short-buffer-optimised result vector: single-valued variables never touch
/// the heap.
pub type Results = SmallVec<[Element; 1]>;

/// The identity of a variable reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullName {
    pub main: &'static str,
    pub sub: String,
}

impl std::fmt::Display for FullName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sub.is_empty() {
            f.write_str(self.main)
        } else {
            write!(f, "{}:{}", self.main, self.sub)
        }
    }
}

/// Sub-name selector of a collection reference.
#[derive(Debug, Clone)]
pub enum SubName {
    None,
    /// Literal key; stored case-folded, compared per the kind's case rule.
    Literal(String),
    /// `/regex/` selector.
    Regex { source: String, pattern: Arc<Pattern> },
    /// `@file@` selector.
    File { source: String, set: Arc<MultiPattern> },
}

impl SubName {
    pub fn text(&self) -> &str {
        match self {
            SubName::None => "",
            SubName::Literal(s) => s,
            SubName::Regex { source, .. } => source,
            SubName::File { source, .. } => source,
        }
    }

    fn selects(&self, key: &str) -> bool {
        match self {
            SubName::None => true,
            SubName::Literal(name) => key.eq_ignore_ascii_case(name),
            SubName::Regex { pattern, .. } => pattern.matches(key),
            SubName::File { set, .. } => set.matches(key),
        }
    }
}

/// Exception matcher attached to a collection node at finalisation time.
#[derive(Debug, Clone)]
pub enum ExceptMatcher {
    Regex(Arc<Pattern>),
    File(Arc<MultiPattern>),
}

/// Exception set of one collection node.
#[derive(Debug, Clone, Default)]
pub struct ExceptSet {
    literals: HashSet<String>,
    matchers: Vec<ExceptMatcher>,
}

impl ExceptSet {
    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.matchers.is_empty()
    }

    pub fn add_literal(&mut self, name: &str) {
        self.literals.insert(name.to_ascii_lowercase());
    }

    pub fn add_matcher(&mut self, matcher: ExceptMatcher) {
        self.matchers.push(matcher);
    }

    pub fn contains(&self, key: &str) -> bool {
        if self.literals.contains(&key.to_ascii_lowercase()) {
            return true;
        }
        self.matchers.iter().any(|m| match m {
            ExceptMatcher::Regex(p) => p.matches(key),
            ExceptMatcher::File(s) => s.matches(key),
        })
    }
}

/// The closed set of variable kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Args,
    ArgsCombinedSize,
    ArgsGet,
    ArgsGetNames,
    ArgsNames,
    ArgsPost,
    ArgsPostNames,
    Duration,
    Env,
    Files,
    FilesCombinedSize,
    FilesNames,
    FilesSizes,
    FullRequest,
    FullRequestLength,
    Geo,
    Global,
    Ip,
    MatchedVar,
    MatchedVarName,
    MatchedVars,
    MatchedVarsNames,
    MultipartFilename,
    MultipartName,
    MultipartPartHeaders,
    MultipartStrictError,
    QueryString,
    RemoteAddr,
    RemotePort,
    ReqbodyError,
    ReqbodyProcessor,
    ReqbodyProcessorError,
    RequestBasename,
    RequestBody,
    RequestBodyLength,
    RequestCookies,
    RequestCookiesNames,
    RequestFilename,
    RequestHeaders,
    RequestHeadersNames,
    RequestLine,
    RequestMethod,
    RequestProtocol,
    RequestUri,
    RequestUriRaw,
    Resource,
    ResponseBody,
    ResponseHeaders,
    ResponseHeadersNames,
    ResponseProtocol,
    ResponseStatus,
    Rule,
    ServerAddr,
    ServerPort,
    Session,
    SessionId,
    Time,
    TimeDay,
    TimeEpoch,
    TimeHour,
    TimeMin,
    TimeMon,
    TimeSec,
    TimeWday,
    TimeYear,
    Tx,
    UniqueId,
    User,
    UserId,
    WebserverErrorLog,
}

impl VariableKind {
    /// Resolve a main name from the rule language (case-insensitive).
    pub fn from_name(name: &str) -> Option<VariableKind> {
        let upper = name.to_ascii_uppercase();
        Some(match upper.as_str() {
            "ARGS" => VariableKind::Args,
            "ARGS_COMBINED_SIZE" => VariableKind::ArgsCombinedSize,
            "ARGS_GET" => VariableKind::ArgsGet,
            "ARGS_GET_NAMES" => VariableKind::ArgsGetNames,
            "ARGS_NAMES" => VariableKind::ArgsNames,
            "ARGS_POST" => VariableKind::ArgsPost,
            "ARGS_POST_NAMES" => VariableKind::ArgsPostNames,
            "DURATION" => VariableKind::Duration,
            "ENV" => VariableKind::Env,
            "FILES" => VariableKind::Files,
            "FILES_COMBINED_SIZE" => VariableKind::FilesCombinedSize,
            "FILES_NAMES" => VariableKind::FilesNames,
            "FILES_SIZES" => VariableKind::FilesSizes,
            "FULL_REQUEST" => VariableKind::FullRequest,
            "FULL_REQUEST_LENGTH" => VariableKind::FullRequestLength,
            "GEO" => VariableKind::Geo,
            "GLOBAL" => VariableKind::Global,
            "IP" => VariableKind::Ip,
            "MATCHED_VAR" => VariableKind::MatchedVar,
            "MATCHED_VAR_NAME" => VariableKind::MatchedVarName,
            "MATCHED_VARS" => VariableKind::MatchedVars,
            "MATCHED_VARS_NAMES" => VariableKind::MatchedVarsNames,
            "MULTIPART_FILENAME" => VariableKind::MultipartFilename,
            "MULTIPART_NAME" => VariableKind::MultipartName,
            "MULTIPART_PART_HEADERS" => VariableKind::MultipartPartHeaders,
            "MULTIPART_STRICT_ERROR" => VariableKind::MultipartStrictError,
            "QUERY_STRING" => VariableKind::QueryString,
            "REMOTE_ADDR" => VariableKind::RemoteAddr,
            "REMOTE_PORT" => VariableKind::RemotePort,
            "REQBODY_ERROR" => VariableKind::ReqbodyError,
            "REQBODY_PROCESSOR" => VariableKind::ReqbodyProcessor,
            "REQBODY_PROCESSOR_ERROR" => VariableKind::ReqbodyProcessorError,
            "REQUEST_BASENAME" => VariableKind::RequestBasename,
            "REQUEST_BODY" => VariableKind::RequestBody,
            "REQUEST_BODY_LENGTH" => VariableKind::RequestBodyLength,
            "REQUEST_COOKIES" => VariableKind::RequestCookies,
            "REQUEST_COOKIES_NAMES" => VariableKind::RequestCookiesNames,
            "REQUEST_FILENAME" => VariableKind::RequestFilename,
            "REQUEST_HEADERS" => VariableKind::RequestHeaders,
            "REQUEST_HEADERS_NAMES" => VariableKind::RequestHeadersNames,
            "REQUEST_LINE" => VariableKind::RequestLine,
            "REQUEST_METHOD" => VariableKind::RequestMethod,
            "REQUEST_PROTOCOL" => VariableKind::RequestProtocol,
            "REQUEST_URI" => VariableKind::RequestUri,
            "REQUEST_URI_RAW" => VariableKind::RequestUriRaw,
            "RESOURCE" => VariableKind::Resource,
            "RESPONSE_BODY" => VariableKind::ResponseBody,
            "RESPONSE_HEADERS" => VariableKind::ResponseHeaders,
            "RESPONSE_HEADERS_NAMES" => VariableKind::ResponseHeadersNames,
            "RESPONSE_PROTOCOL" => VariableKind::ResponseProtocol,
            "RESPONSE_STATUS" => VariableKind::ResponseStatus,
            "RULE" => VariableKind::Rule,
            "SERVER_ADDR" => VariableKind::ServerAddr,
            "SERVER_PORT" => VariableKind::ServerPort,
            "SESSION" => VariableKind::Session,
            "SESSIONID" => VariableKind::SessionId,
            "TIME" => VariableKind::Time,
            "TIME_DAY" => VariableKind::TimeDay,
            "TIME_EPOCH" => VariableKind::TimeEpoch,
            "TIME_HOUR" => VariableKind::TimeHour,
            "TIME_MIN" => VariableKind::TimeMin,
            "TIME_MON" => VariableKind::TimeMon,
            "TIME_SEC" => VariableKind::TimeSec,
            "TIME_WDAY" => VariableKind::TimeWday,
            "TIME_YEAR" => VariableKind::TimeYear,
            "TX" => VariableKind::Tx,
            "UNIQUE_ID" => VariableKind::UniqueId,
            "USER" => VariableKind::User,
            "USERID" => VariableKind::UserId,
            "WEBSERVER_ERROR_LOG" => VariableKind::WebserverErrorLog,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariableKind::Args => "ARGS",
            VariableKind::ArgsCombinedSize => "ARGS_COMBINED_SIZE",
            VariableKind::ArgsGet => "ARGS_GET",
            VariableKind::ArgsGetNames => "ARGS_GET_NAMES",
            VariableKind::ArgsNames => "ARGS_NAMES",
            VariableKind::ArgsPost => "ARGS_POST",
            VariableKind::ArgsPostNames => "ARGS_POST_NAMES",
            VariableKind::Duration => "DURATION",
            VariableKind::Env => "ENV",
            VariableKind::Files => "FILES",
            VariableKind::FilesCombinedSize => "FILES_COMBINED_SIZE",
            VariableKind::FilesNames => "FILES_NAMES",
            VariableKind::FilesSizes => "FILES_SIZES",
            VariableKind::FullRequest => "FULL_REQUEST",
            VariableKind::FullRequestLength => "FULL_REQUEST_LENGTH",
            VariableKind::Geo => "GEO",
            VariableKind::Global => "GLOBAL",
            VariableKind::Ip => "IP",
            VariableKind::MatchedVar => "MATCHED_VAR",
            VariableKind::MatchedVarName => "MATCHED_VAR_NAME",
            VariableKind::MatchedVars => "MATCHED_VARS",
            VariableKind::MatchedVarsNames => "MATCHED_VARS_NAMES",
            VariableKind::MultipartFilename => "MULTIPART_FILENAME",
            VariableKind::MultipartName => "MULTIPART_NAME",
            VariableKind::MultipartPartHeaders => "MULTIPART_PART_HEADERS",
            VariableKind::MultipartStrictError => "MULTIPART_STRICT_ERROR",
            VariableKind::QueryString => "QUERY_STRING",
            VariableKind::RemoteAddr => "REMOTE_ADDR",
            VariableKind::RemotePort => "REMOTE_PORT",
            VariableKind::ReqbodyError => "REQBODY_ERROR",
            VariableKind::ReqbodyProcessor => "REQBODY_PROCESSOR",
            VariableKind::ReqbodyProcessorError => "REQBODY_PROCESSOR_ERROR",
            VariableKind::RequestBasename => "REQUEST_BASENAME",
            VariableKind::RequestBody => "REQUEST_BODY",
            VariableKind::RequestBodyLength => "REQUEST_BODY_LENGTH",
            VariableKind::RequestCookies => "REQUEST_COOKIES",
            VariableKind::RequestCookiesNames => "REQUEST_COOKIES_NAMES",
            VariableKind::RequestFilename => "REQUEST_FILENAME",
            VariableKind::RequestHeaders => "REQUEST_HEADERS",
            VariableKind::RequestHeadersNames => "REQUEST_HEADERS_NAMES",
            VariableKind::RequestLine => "REQUEST_LINE",
            VariableKind::RequestMethod => "REQUEST_METHOD",
            VariableKind::RequestProtocol => "REQUEST_PROTOCOL",
            VariableKind::RequestUri => "REQUEST_URI",
            VariableKind::RequestUriRaw => "REQUEST_URI_RAW",
            VariableKind::Resource => "RESOURCE",
            VariableKind::ResponseBody => "RESPONSE_BODY",
            VariableKind::ResponseHeaders => "RESPONSE_HEADERS",
            VariableKind::ResponseHeadersNames => "RESPONSE_HEADERS_NAMES",
            VariableKind::ResponseProtocol => "RESPONSE_PROTOCOL",
            VariableKind::ResponseStatus => "RESPONSE_STATUS",
            VariableKind::Rule => "RULE",
            VariableKind::ServerAddr => "SERVER_ADDR",
            VariableKind::ServerPort => "SERVER_PORT",
            VariableKind::Session => "SESSION",
            VariableKind::SessionId => "SESSIONID",
            VariableKind::Time => "TIME",
            VariableKind::TimeDay => "TIME_DAY",
            VariableKind::TimeEpoch => "TIME_EPOCH",
            VariableKind::TimeHour => "TIME_HOUR",
            VariableKind::TimeMin => "TIME_MIN",
            VariableKind::TimeMon => "TIME_MON",
            VariableKind::TimeSec => "TIME_SEC",
            VariableKind::TimeWday => "TIME_WDAY",
            VariableKind::TimeYear => "TIME_YEAR",
            VariableKind::Tx => "TX",
            VariableKind::UniqueId => "UNIQUE_ID",
            VariableKind::User => "USER",
            VariableKind::UserId => "USERID",
            VariableKind::WebserverErrorLog => "WEBSERVER_ERROR_LOG",
        }
    }

    /// Kinds that expand to `(key, value)` pairs.
    pub fn is_collection_kind(&self) -> bool {
        matches!(
            self,
            VariableKind::Args
                | VariableKind::ArgsGet
                | VariableKind::ArgsGetNames
                | VariableKind::ArgsNames
                | VariableKind::ArgsPost
                | VariableKind::ArgsPostNames
                | VariableKind::Env
                | VariableKind::Files
                | VariableKind::FilesNames
                | VariableKind::FilesSizes
                | VariableKind::Geo
                | VariableKind::Global
                | VariableKind::Ip
                | VariableKind::MatchedVars
                | VariableKind::MatchedVarsNames
                | VariableKind::MultipartFilename
                | VariableKind::MultipartName
                | VariableKind::MultipartPartHeaders
                | VariableKind::RequestCookies
                | VariableKind::RequestCookiesNames
                | VariableKind::RequestHeaders
                | VariableKind::RequestHeadersNames
                | VariableKind::Resource
                | VariableKind::ResponseHeaders
                | VariableKind::ResponseHeadersNames
                | VariableKind::Session
                | VariableKind::Tx
                | VariableKind::User
        )
    }
}

/// A compiled variable node.
#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: VariableKind,
    pub sub_name: SubName,
    pub is_not: bool,
    pub is_counter: bool,
    /// Exceptions attached by rule finalisation; only used by collections.
    pub except: ExceptSet,
}

impl Variable {
    pub fn new(kind: VariableKind, sub_name: SubName, is_not: bool, is_counter: bool) -> Self {
        Variable {
            kind,
            sub_name,
            is_not,
            is_counter,
            except: ExceptSet::default(),
        }
    }

    pub fn full_name(&self) -> FullName {
        FullName {
            main: self.kind.name(),
            sub: self.sub_name.text().to_string(),
        }
    }

    /// A node is a collection when it can yield more than one element.
    pub fn is_collection(&self) -> bool {
        self.kind.is_collection_kind()
            && !matches!(self.sub_name, SubName::Literal(_))
    }

    pub fn is_not(&self) -> bool {
        self.is_not
    }

    pub fn is_counter(&self) -> bool {
        self.is_counter
    }

    /// Extract this node's values from the transaction.
    ///
    /// `rule` is the rule currently being evaluated; the `RULE` and
    /// `MATCHED_*` kinds read it for metadata and chain level.
    pub fn evaluate(&self, txn: &mut Transaction<'_>, rule: &Rule, out: &mut Results) {
        if self.is_counter {
            let mut count: i64 = 0;
            self.each_value(txn, rule, &mut |_, _| count += 1);
            out.push(Element::new(count));
            return;
        }
        let mut sink = std::mem::take(out);
        self.each_value(txn, rule, &mut |key, value| {
            sink.push(match key {
                Some(key) => Element::keyed(key, value),
                None => Element::new(value),
            });
        });
        *out = sink;
    }

    fn each_value(
        &self,
        txn: &mut Transaction<'_>,
        rule: &Rule,
        emit: &mut dyn FnMut(Option<Arc<str>>, Variant),
    ) {
        use VariableKind::*;

        // Collection entry filter: sub-name selection, the node's exception
        // set, and per-transaction ctl target removal.
        let selected = |txn: &Transaction<'_>, key: &str| -> bool {
            if !self.sub_name.selects(key) {
                return false;
            }
            if self.except.contains(key) {
                return false;
            }
            // ctl:ruleRemoveTarget* applies to the evaluating top-level rule
            !txn.is_rule_target_removed(rule, self.kind.name(), key)
        };

        match self.kind {
            Args => {
                let pairs: Vec<(Arc<str>, Arc<str>)> = txn
                    .query_args
                    .iter()
                    .chain(txn.body_args.iter())
                    .cloned()
                    .collect();
                for (k, v) in pairs {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            ArgsGet => {
                for (k, v) in txn.query_args.clone() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(v));
                    }
                }
            }
            ArgsPost => {
                for (k, v) in txn.body_args.clone() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(v));
                    }
                }
            }
            ArgsNames => {
                let names: Vec<Arc<str>> = txn
                    .query_args
                    .iter()
                    .chain(txn.body_args.iter())
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in names {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k));
                    }
                }
            }
            ArgsGetNames => {
                for (k, _) in txn.query_args.clone() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k.clone()));
                    }
                }
            }
            ArgsPostNames => {
                for (k, _) in txn.body_args.clone() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k.clone()));
                    }
                }
            }
            ArgsCombinedSize => {
                let size: usize = txn
                    .query_args
                    .iter()
                    .chain(txn.body_args.iter())
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                emit(None, Variant::Int(size as i64));
            }
            QueryString => emit(None, txn.request_line.query.clone().into_variant()),
            RequestMethod => emit(None, txn.request_line.method.clone().into_variant()),
            RequestProtocol => emit(None, txn.request_line.protocol.clone().into_variant()),
            RequestUri => emit(None, txn.request_line.uri.clone().into_variant()),
            RequestUriRaw => emit(None, txn.request_line.uri_raw.clone().into_variant()),
            RequestLine => emit(None, txn.request_line.line.clone().into_variant()),
            RequestFilename => emit(None, txn.request_line.relative_path.clone().into_variant()),
            RequestBasename => {
                let path = txn.request_line.relative_path.clone();
                let base = path.rsplit('/').next().unwrap_or("");
                emit(None, Variant::from(base));
            }
            RequestBody => {
                if let Some(body) = txn.request_body.clone() {
                    emit(None, Variant::Str(body));
                } else {
                    emit(None, Variant::Empty);
                }
            }
            RequestBodyLength => {
                let len = txn.request_body.as_ref().map_or(0, |b| b.len());
                emit(None, Variant::Int(len as i64));
            }
            FullRequest => emit(None, Variant::Str(txn.full_request())),
            FullRequestLength => emit(None, Variant::Int(txn.full_request().len() as i64)),
            RequestHeaders => {
                for (k, v) in txn.request_headers() {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            RequestHeadersNames => {
                for (k, _) in txn.request_headers() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k));
                    }
                }
            }
            ResponseHeaders => {
                for (k, v) in txn.response_headers() {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            ResponseHeadersNames => {
                for (k, _) in txn.response_headers() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k));
                    }
                }
            }
            RequestCookies => {
                txn.ensure_cookies();
                for (k, v) in txn.cookies.clone() {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            RequestCookiesNames => {
                txn.ensure_cookies();
                for (k, _) in txn.cookies.clone() {
                    if selected(txn, &k) {
                        emit(Some(k.clone()), Variant::Str(k));
                    }
                }
            }
            Files => {
                for file in txn.files.clone() {
                    if selected(txn, &file.name) {
                        emit(Some(file.name.clone()), Variant::Str(file.filename.clone()));
                    }
                }
            }
            FilesNames => {
                for file in txn.files.clone() {
                    if selected(txn, &file.name) {
                        emit(Some(file.name.clone()), Variant::Str(file.name.clone()));
                    }
                }
            }
            FilesSizes => {
                for file in txn.files.clone() {
                    if selected(txn, &file.name) {
                        emit(Some(file.name.clone()), Variant::Int(file.size as i64));
                    }
                }
            }
            FilesCombinedSize => {
                let size: u64 = txn.files.iter().map(|f| f.size).sum();
                emit(None, Variant::Int(size as i64));
            }
            MultipartName => {
                for file in txn.files.clone() {
                    if selected(txn, &file.name) {
                        emit(Some(file.name.clone()), Variant::Str(file.name.clone()));
                    }
                }
            }
            MultipartFilename => {
                for file in txn.files.clone() {
                    if selected(txn, &file.name) {
                        emit(Some(file.name.clone()), Variant::Str(file.filename.clone()));
                    }
                }
            }
            MultipartPartHeaders => {
                for (k, v) in txn.multipart_part_headers.clone() {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            MultipartStrictError => {
                emit(None, Variant::Int(txn.multipart_strict_error as i64));
            }
            ReqbodyError => emit(None, Variant::Int(txn.reqbody_error as i64)),
            ReqbodyProcessorError => {
                emit(None, Variant::Int(txn.reqbody_processor_error as i64))
            }
            ReqbodyProcessor => {
                let name = txn
                    .body_processor
                    .map(|p| p.name())
                    .unwrap_or("");
                emit(None, Variant::from(name));
            }
            RemoteAddr => emit(None, txn.connection.downstream_ip.clone().into_variant()),
            RemotePort => emit(None, Variant::Int(txn.connection.downstream_port as i64)),
            ServerAddr => emit(None, txn.connection.upstream_ip.clone().into_variant()),
            ServerPort => emit(None, Variant::Int(txn.connection.upstream_port as i64)),
            ResponseStatus => emit(None, txn.response_line.status.clone().into_variant()),
            ResponseProtocol => emit(None, txn.response_line.protocol.clone().into_variant()),
            ResponseBody => {
                if let Some(body) = txn.response_body.clone() {
                    emit(None, Variant::Str(body));
                } else {
                    emit(None, Variant::Empty);
                }
            }
            Tx => match &self.sub_name {
                SubName::Literal(name) => {
                    // TX:0..TX:9 read the captures, everything else the slots
                    if let Ok(index) = name.parse::<usize>() {
                        if index < 10 {
                            emit(None, txn.capture(index));
                            return;
                        }
                    }
                    emit(None, txn.get_tx_variable(name));
                }
                _ => {
                    for (name, value) in txn.tx_variables_snapshot() {
                        if selected(txn, &name) {
                            emit(Some(name), value);
                        }
                    }
                }
            },
            Rule => {
                let value = match self.sub_name.text() {
                    "id" => Variant::Int(rule.id as i64),
                    "phase" => Variant::Int(rule.phase as i64),
                    "operator_value" => rule
                        .operator
                        .as_ref()
                        .map(|op| Variant::from(op.literal_value()))
                        .unwrap_or(Variant::Empty),
                    _ => Variant::Empty,
                };
                emit(None, value);
            }
            MatchedVar => {
                let level = txn.matched_level(rule.chain_index);
                let value = level
                    .last()
                    .map(|m| m.transformed.clone())
                    .unwrap_or(Variant::Empty);
                emit(None, value);
            }
            MatchedVarName => {
                let level = txn.matched_level(rule.chain_index);
                let value = level
                    .last()
                    .map(|m| Variant::from(m.full_name.to_string()))
                    .unwrap_or(Variant::Empty);
                emit(None, value);
            }
            MatchedVars => {
                for m in txn.matched_level(rule.chain_index).to_vec() {
                    let key: Arc<str> = Arc::from(m.full_name.to_string());
                    if selected(txn, &key) {
                        emit(Some(key), m.transformed.clone());
                    }
                }
            }
            MatchedVarsNames => {
                for m in txn.matched_level(rule.chain_index).to_vec() {
                    let key: Arc<str> = Arc::from(m.full_name.to_string());
                    if selected(txn, &key) {
                        emit(Some(key.clone()), Variant::Str(key));
                    }
                }
            }
            Geo => {
                for (k, v) in txn.geo.clone() {
                    if selected(txn, &k) {
                        emit(Some(k), Variant::Str(v));
                    }
                }
            }
            Global => self.persistent(txn, "GLOBAL", rule, emit),
            Ip => self.persistent(txn, "IP", rule, emit),
            Session => self.persistent(txn, "SESSION", rule, emit),
            User => self.persistent(txn, "USER", rule, emit),
            Resource => self.persistent(txn, "RESOURCE", rule, emit),
            SessionId => emit(None, txn.session_id.clone().into_variant()),
            UserId => emit(None, txn.user_id.clone().into_variant()),
            Env => match &self.sub_name {
                SubName::Literal(name) => {
                    let value = std::env::var(name)
                        .ok()
                        .map(Variant::from)
                        .unwrap_or(Variant::Empty);
                    emit(None, value);
                }
                _ => {
                    let mut vars: Vec<(String, String)> = std::env::vars().collect();
                    vars.sort();
                    for (k, v) in vars {
                        if selected(txn, &k) {
                            emit(Some(Arc::from(k)), Variant::from(v));
                        }
                    }
                }
            },
            Time => emit(None, Variant::from(txn.created_at.format("%H:%M:%S").to_string())),
            TimeDay => emit(None, Variant::Int(fmt_time(txn, "%d"))),
            TimeEpoch => emit(None, Variant::Int(txn.created_at.timestamp())),
            TimeHour => emit(None, Variant::Int(fmt_time(txn, "%H"))),
            TimeMin => emit(None, Variant::Int(fmt_time(txn, "%M"))),
            TimeMon => emit(None, Variant::Int(fmt_time(txn, "%m"))),
            TimeSec => emit(None, Variant::Int(fmt_time(txn, "%S"))),
            TimeWday => emit(None, Variant::Int(fmt_time(txn, "%u"))),
            TimeYear => emit(None, Variant::Int(fmt_time(txn, "%Y"))),
            Duration => emit(None, Variant::Int(txn.duration_ms())),
            UniqueId => {
                let id = txn.unique_id();
                emit(None, Variant::Str(id));
            }
            WebserverErrorLog => emit(None, Variant::Empty),
        }
    }

    fn persistent(
        &self,
        txn: &mut Transaction<'_>,
        collection: &'static str,
        rule: &Rule,
        emit: &mut dyn FnMut(Option<Arc<str>>, Variant),
    ) {
        let Some(entries) = txn.persistent_entries(collection) else {
            return;
        };
        for (k, v) in entries {
            if !self.sub_name.selects(&k) || self.except.contains(&k) {
                continue;
            }
            if txn.is_rule_target_removed(rule, self.kind.name(), &k) {
                continue;
            }
            emit(Some(k), Variant::Str(v));
        }
    }
}

fn fmt_time(txn: &Transaction<'_>, format: &str) -> i64 {
    txn.created_at
        .format(format)
        .to_string()
        .parse::<i64>()
        .unwrap_or(0)
}

/// Owned-or-empty string helper for the scalar request properties.
pub(crate) trait IntoVariant {
    fn into_variant(self) -> Variant;
}

impl IntoVariant for Option<Arc<str>> {
    fn into_variant(self) -> Variant {
        match self {
            Some(s) => Variant::Str(s),
            None => Variant::Empty,
        }
    }
}

impl IntoVariant for Arc<str> {
    fn into_variant(self) -> Variant {
        Variant::Str(self)
    }
}
