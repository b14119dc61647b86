//! The engine: compile-time owner of the rule set and factory for
//! transactions.
//!
//! Compile time is single-threaded by construction: every mutating call
//! takes `&mut self`. After `init()` the rule set is frozen and the engine
//! is shared read-only (`Send + Sync`) across worker threads.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{AuditLogConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::parser::Parser;
use crate::ruleset::RuleSet;
use crate::transaction::Transaction;

/// Host resolver for the `geoLookup` operator: IP text in, `(field, value)`
/// pairs out. The callback may block; the engine never calls it
/// re-entrantly.
pub type GeoLookupFn = dyn Fn(&str) -> Option<Vec<(String, String)>> + Send + Sync;
/// Host scanner for `inspectFile`: (path, operator argument).
pub type InspectFileFn = dyn Fn(&str, &str) -> bool + Send + Sync;
/// Host matcher for `fuzzyHash`: (subject, operator argument).
pub type FuzzyHashFn = dyn Fn(&str, &str) -> bool + Send + Sync;
/// Host resolver for `rbl`: (subject, blocklist zone).
pub type RblFn = dyn Fn(&str, &str) -> bool + Send + Sync;
/// Host XML validator for `validateDTD` / `validateSchema`: (subject, path).
pub type ValidateXmlFn = dyn Fn(&str, &str) -> bool + Send + Sync;

/// I/O-performing operators delegate to these host callbacks. All optional;
/// a missing callback degrades the operator to no-match with a warning.
#[derive(Default, Clone)]
pub struct HostCallbacks {
    pub geo_lookup: Option<Arc<GeoLookupFn>>,
    pub inspect_file: Option<Arc<InspectFileFn>>,
    pub fuzzy_hash: Option<Arc<FuzzyHashFn>>,
    pub rbl: Option<Arc<RblFn>>,
    pub validate_dtd: Option<Arc<ValidateXmlFn>>,
    pub validate_schema: Option<Arc<ValidateXmlFn>>,
}

/// Host-provided storage for the cross-transaction collections (GLOBAL, IP,
/// SESSION, USER, RESOURCE). The store serialises concurrent updates;
/// entries iterate in insertion order.
pub trait PersistentStore: Send + Sync {
    fn entries(&self, collection: &str, key: &str) -> Vec<(String, String)>;
    fn put(&self, collection: &str, key: &str, name: &str, value: &str);
    fn remove(&self, collection: &str, key: &str, name: &str);
}

pub struct Engine {
    ruleset: RuleSet,
    config: EngineConfig,
    audit_config: AuditLogConfig,
    callbacks: HostCallbacks,
    store: Option<Arc<dyn PersistentStore>>,
    is_init: bool,
}

impl Engine {
    /// Construct an engine and install the log subscriber. Must be called on
    /// the main thread, before any rules load.
    ///
    /// `log_level` follows the `tracing` EnvFilter syntax ("info",
    /// "secrule_engine=debug", ...). A subscriber already installed by the
    /// host wins silently.
    pub fn new(log_level: &str, log_file: Option<&Path>) -> Engine {
        let filter = tracing_subscriber::EnvFilter::try_new(log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = match log_file {
            Some(path) => match std::fs::File::create(path) {
                Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).try_init(),
                Err(_) => builder.try_init(),
            },
            None => builder.try_init(),
        };
        if installed.is_ok() {
            info!(version = env!("CARGO_PKG_VERSION"), "Rule engine created");
        }

        Engine {
            ruleset: RuleSet::new(),
            config: EngineConfig::default(),
            audit_config: AuditLogConfig::default(),
            callbacks: HostCallbacks::default(),
            store: None,
            is_init: false,
        }
    }

    /// Load directives from a file. Relative `Include` paths resolve
    /// against the including file.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        Parser::new(self).load_file(path.as_ref())
    }

    /// Load directives from a string.
    pub fn load(&mut self, directives: &str) -> Result<()> {
        Parser::new(self).load_str(directives, "<inline>")
    }

    /// Freeze the rule set: validate the configuration, fold exception
    /// variables, inherit default-action flags, resolve ctl references and
    /// marker skips. Must be called once, after all `load*` calls.
    pub fn init(&mut self) -> Result<()> {
        if self.is_init {
            return Err(EngineError::InvalidState(
                "Engine::init called twice".to_string(),
            ));
        }
        self.config.validate()?;
        self.ruleset.init();
        self.is_init = true;

        let rule_count: usize = self
            .ruleset
            .rules_by_phase
            .iter()
            .map(Vec::len)
            .sum();
        info!(
            rules = rule_count,
            tx_slots = self.ruleset.tx_slot_count(),
            "Rule set frozen"
        );
        Ok(())
    }

    /// Create a per-request transaction. Requires `init()`.
    pub fn make_transaction(&self) -> Transaction<'_> {
        assert!(self.is_init, "Engine::make_transaction before init");
        Transaction::new(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn audit_config(&self) -> &AuditLogConfig {
        &self.audit_config
    }

    pub(crate) fn audit_config_mut(&mut self) -> &mut AuditLogConfig {
        &mut self.audit_config
    }

    pub fn ruleset(&self) -> &RuleSet {
        &self.ruleset
    }

    pub(crate) fn ruleset_mut(&mut self) -> &mut RuleSet {
        &mut self.ruleset
    }

    pub fn callbacks(&self) -> &HostCallbacks {
        &self.callbacks
    }

    /// Install host callbacks for the I/O operators. Main-thread only.
    pub fn set_callbacks(&mut self, callbacks: HostCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn persistent_store(&self) -> Option<&Arc<dyn PersistentStore>> {
        self.store.as_ref()
    }

    /// Install the cross-transaction collection store. Main-thread only.
    pub fn set_persistent_store(&mut self, store: Arc<dyn PersistentStore>) {
        self.store = Some(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_double_init_rejected() {
        let mut engine = Engine::new("error", None);
        engine.init().unwrap();
        assert!(engine.init().is_err());
    }
}
