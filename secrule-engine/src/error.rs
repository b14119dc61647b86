use thiserror::Error;

/// Errors that can occur while building a rule set.
///
/// Request-time evaluation never surfaces errors to the host: a misbehaving
/// operator or transformation degrades to a no-match and a warning log.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration directive error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directive parse error, pointing back to file:line:column
    #[error("Parse error: {0}")]
    Parse(String),

    /// Pattern compilation error
    #[error("Pattern error: {0}")]
    Pattern(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl EngineError {
    /// Build a parse error carrying the source position.
    pub fn at(file: &str, line: usize, column: usize, msg: impl AsRef<str>) -> Self {
        EngineError::Parse(format!("{}:{}:{}: {}", file, line, column, msg.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Config("unknown directive SecBogus".to_string());
        assert_eq!(err.to_string(), "Configuration error: unknown directive SecBogus");
    }

    #[test]
    fn test_error_from_string() {
        let err: EngineError = "test error".into();
        assert!(matches!(err, EngineError::Other(_)));
    }

    #[test]
    fn test_parse_error_position() {
        let err = EngineError::at("waf.conf", 12, 4, "expected operator");
        assert_eq!(err.to_string(), "Parse error: waf.conf:12:4: expected operator");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
