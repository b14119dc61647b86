//! secrule-engine
//!
//! An embeddable, ModSecurity-compatible WAF rule engine: a frozen compiled
//! rule model plus a per-transaction evaluation pipeline producing
//! allow / block / deny / redirect decisions and structured match records.
//!
//! The engine compiles once on the main thread (`Engine::load*` +
//! `Engine::init`), then evaluates many concurrent transactions read-only
//! over the shared rule set. It never parses HTTP wire bytes itself: the
//! host supplies extractor closures for headers and bodies.

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod operator;
pub mod parser;
pub mod pattern;
pub mod rule;
pub mod ruleset;
pub mod transaction;
pub mod transform;
pub mod variable;
pub mod variant;

// Re-export commonly used types
pub use config::{AuditLogConfig, BodyProcessor, EngineConfig, EngineOption, PHASE_TOTAL};
pub use engine::{Engine, HostCallbacks, PersistentStore};
pub use error::{EngineError, Result};
pub use rule::{Disruptive, Rule, Severity};
pub use transaction::{
    BodyExtract, HeaderFind, HeaderTraverse, Intervention, LogCallback, MatchedVariable,
    Transaction,
};
pub use transform::Transform;
pub use variant::Variant;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        // Simple test to ensure the core types are exported
        let _ = std::any::type_name::<Engine>();
        let _ = std::any::type_name::<EngineConfig>();
        let _ = std::any::type_name::<Transaction<'_>>();
        let _ = std::any::type_name::<MatchedVariable>();
    }
}
