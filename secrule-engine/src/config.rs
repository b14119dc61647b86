use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Number of processing phases. Rules are stored per phase, index = phase - 1.
///
/// 1. Request headers are read
/// 2. Request body is read
/// 3. Response headers are read
/// 4. Response body is read
/// 5. Logging
pub const PHASE_TOTAL: usize = 5;

/// Tri-state used by the engine switches (`SecRuleEngine` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineOption {
    On,
    #[default]
    Off,
    DetectionOnly,
}

impl EngineOption {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            s if s.eq_ignore_ascii_case("on") => Ok(EngineOption::On),
            s if s.eq_ignore_ascii_case("off") => Ok(EngineOption::Off),
            s if s.eq_ignore_ascii_case("detectiononly") => Ok(EngineOption::DetectionOnly),
            other => Err(EngineError::Config(format!(
                "expected On/Off/DetectionOnly, got '{other}'"
            ))),
        }
    }
}

/// What to do when a body limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BodyLimitAction {
    Reject,
    #[default]
    ProcessPartial,
}

impl BodyLimitAction {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            s if s.eq_ignore_ascii_case("reject") => Ok(BodyLimitAction::Reject),
            s if s.eq_ignore_ascii_case("processpartial") => Ok(BodyLimitAction::ProcessPartial),
            other => Err(EngineError::Config(format!(
                "expected Reject/ProcessPartial, got '{other}'"
            ))),
        }
    }
}

/// Request body processor selected from Content-Type or `ctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyProcessor {
    UrlEncoded,
    MultiPart,
    Json,
    Xml,
}

impl BodyProcessor {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            s if s.eq_ignore_ascii_case("urlencoded") => Ok(BodyProcessor::UrlEncoded),
            s if s.eq_ignore_ascii_case("multipart") => Ok(BodyProcessor::MultiPart),
            s if s.eq_ignore_ascii_case("json") => Ok(BodyProcessor::Json),
            s if s.eq_ignore_ascii_case("xml") => Ok(BodyProcessor::Xml),
            other => Err(EngineError::Config(format!(
                "unknown request body processor '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BodyProcessor::UrlEncoded => "URLENCODED",
            BodyProcessor::MultiPart => "MULTIPART",
            BodyProcessor::Json => "JSON",
            BodyProcessor::Xml => "XML",
        }
    }
}

/// Engine configuration populated by the compile-time directives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SecRuleEngine: gates all request-time processing
    pub rule_engine: EngineOption,
    /// SecRequestBodyAccess
    pub request_body_access: EngineOption,
    /// SecResponseBodyAccess
    pub response_body_access: EngineOption,
    /// SecRequestBodyLimit (bytes)
    pub request_body_limit: u64,
    /// SecRequestBodyNoFilesLimit (bytes)
    pub request_body_no_files_limit: u64,
    /// SecRequestBodyJsonDepthLimit (0 = unlimited)
    pub request_body_json_depth_limit: u64,
    /// SecResponseBodyLimit (bytes)
    pub response_body_limit: u64,
    /// SecRequestBodyLimitAction
    pub request_body_limit_action: BodyLimitAction,
    /// SecResponseBodyLimitAction
    pub response_body_limit_action: BodyLimitAction,
    /// SecResponseBodyMimeType (additive list)
    pub response_body_mime_types: Vec<String>,
    /// SecArgumentsLimit (0 = unlimited)
    pub arguments_limit: u32,
    /// SecArgumentSeparator
    pub argument_separator: char,
    /// SecUploadFileLimit
    pub upload_file_limit: u32,
    /// SecUnicodeMapFile path
    pub unicode_map_file: String,
    /// SecUnicodeMapFile code point
    pub unicode_code_point: u32,
    /// Parsed unicode map (from -> to), loaded with the directive
    #[serde(skip)]
    pub unicode_map: HashMap<u32, u32>,
    /// SecPcreMatchLimit: step limit for the backtracking regex back-end
    pub pcre_match_limit: u32,
    /// SecPmfSerializeDir: directory for multi-pattern database serialisation
    pub pmf_serialize_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_engine: EngineOption::Off,
            request_body_access: EngineOption::Off,
            response_body_access: EngineOption::Off,
            request_body_limit: 134_217_728,
            request_body_no_files_limit: 1_048_576,
            request_body_json_depth_limit: 0,
            response_body_limit: 524_288,
            request_body_limit_action: BodyLimitAction::ProcessPartial,
            response_body_limit_action: BodyLimitAction::ProcessPartial,
            response_body_mime_types: vec![
                "text/plain".to_string(),
                "text/html".to_string(),
            ],
            arguments_limit: 0,
            argument_separator: '&',
            upload_file_limit: 0,
            unicode_map_file: String::new(),
            unicode_code_point: 20127,
            unicode_map: HashMap::new(),
            pcre_match_limit: 0,
            pmf_serialize_dir: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load a two-column `from \t to` unicode map file for the configured
    /// code point section.
    pub fn load_unicode_map(&mut self, path: &Path, code_point: u32) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.unicode_map_file = path.display().to_string();
        self.unicode_code_point = code_point;
        self.unicode_map.clear();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split_whitespace();
            let (Some(from), Some(to)) = (cols.next(), cols.next()) else {
                continue;
            };
            let from = u32::from_str_radix(from, 16)
                .map_err(|e| EngineError::Config(format!("bad unicode map entry '{line}': {e}")))?;
            let to = u32::from_str_radix(to, 16)
                .map_err(|e| EngineError::Config(format!("bad unicode map entry '{line}': {e}")))?;
            self.unicode_map.insert(from, to);
        }
        Ok(())
    }

    /// Cross-field consistency checks, run at `Engine::init`.
    pub fn validate(&self) -> Result<()> {
        if self.request_body_no_files_limit > self.request_body_limit {
            return Err(EngineError::Config(
                "SecRequestBodyNoFilesLimit exceeds SecRequestBodyLimit".to_string(),
            ));
        }
        if !self.argument_separator.is_ascii() {
            return Err(EngineError::Config(
                "SecArgumentSeparator must be a single ASCII character".to_string(),
            ));
        }
        Ok(())
    }
}

/// Audit engine switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditEngine {
    On,
    #[default]
    Off,
    RelevantOnly,
}

/// Audit log transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditLogType {
    #[default]
    Serial,
    Concurrent,
    Https,
}

/// Audit log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditLogFormat {
    #[default]
    Native,
    Json,
}

/// Audit sink configuration. The engine records it and exposes it to the
/// host-side sink; it does not write audit files itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLogConfig {
    /// SecAuditEngine
    pub engine: AuditEngine,
    /// SecAuditLogType
    pub log_type: AuditLogType,
    /// SecAuditLogFormat
    pub format: AuditLogFormat,
    /// SecAuditLog
    pub log_path: String,
    /// SecAuditLog2
    pub log_path2: String,
    /// SecAuditLogStorageDir
    pub storage_dir: String,
    /// SecAuditLogDirMode (octal)
    pub dir_mode: u32,
    /// SecAuditLogFileMode (octal)
    pub file_mode: u32,
    /// SecAuditLogParts: part letters A..Z as a bit set
    pub log_parts: u32,
    /// SecAuditLogRelevantStatus regex text
    pub relevant_status: String,
}

impl AuditLogConfig {
    /// Parse a `SecAuditLogParts` letter list (e.g. "ABIJDEFHZ").
    pub fn parse_parts(s: &str) -> Result<u32> {
        let mut parts = 0u32;
        for c in s.chars() {
            let c = c.to_ascii_uppercase();
            if !c.is_ascii_uppercase() {
                return Err(EngineError::Config(format!(
                    "invalid audit log part '{c}'"
                )));
            }
            parts |= 1 << (c as u32 - 'A' as u32);
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_parse() {
        assert_eq!(EngineOption::parse("On").unwrap(), EngineOption::On);
        assert_eq!(
            EngineOption::parse("detectiononly").unwrap(),
            EngineOption::DetectionOnly
        );
        assert!(EngineOption::parse("maybe").is_err());
    }

    #[test]
    fn test_defaults_match_modsecurity() {
        let config = EngineConfig::default();
        assert_eq!(config.request_body_limit, 134_217_728);
        assert_eq!(config.response_body_limit, 524_288);
        assert_eq!(config.argument_separator, '&');
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_limits() {
        let config = EngineConfig {
            request_body_limit: 1024,
            request_body_no_files_limit: 2048,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audit_parts() {
        let parts = AuditLogConfig::parse_parts("ABZ").unwrap();
        assert_ne!(parts & (1 << 0), 0);
        assert_ne!(parts & (1 << 1), 0);
        assert_ne!(parts & (1 << 25), 0);
        assert_eq!(parts & (1 << 2), 0);
    }
}
