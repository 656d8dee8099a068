//! Module registry for the refresh orchestrator.
//!
//! Dispatch is data-driven: module executors are registered at startup
//! in execution order, and the critical set is plain data alongside
//! them. No string-matched dispatch chains.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::executor::ResultCounts;
use crate::models::Entity;

/// A subtask failure. `failed_host` feeds the dead-source counter when
/// the failure was an external fetch against a specific host.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ModuleFailure {
    pub message: String,
    pub failed_host: Option<String>,
}

impl ModuleFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed_host: None,
        }
    }

    pub fn fetch(message: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed_host: Some(host.into()),
        }
    }
}

/// One intelligence module (subtask) run against an entity.
#[async_trait]
pub trait ModuleExecutor: Send + Sync {
    async fn run(&self, entity: &Entity) -> Result<ResultCounts, ModuleFailure>;
}

/// Ordered module dispatch table plus the critical set.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<(&'static str, Arc<dyn ModuleExecutor>)>,
    critical: HashSet<&'static str>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module in execution order.
    ///
    /// # Panics
    /// Panics if the name is already registered (startup-time misuse).
    pub fn register(&mut self, name: &'static str, executor: Arc<dyn ModuleExecutor>) {
        if self.modules.iter().any(|(n, _)| *n == name) {
            panic!("module already registered: {}", name);
        }
        self.modules.push((name, executor));
    }

    /// Register a module whose failure withholds entity completion.
    pub fn register_critical(&mut self, name: &'static str, executor: Arc<dyn ModuleExecutor>) {
        self.register(name, executor);
        self.critical.insert(name);
    }

    pub fn is_critical(&self, name: &str) -> bool {
        self.critical.contains(name)
    }

    /// Modules in registration (execution) order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Arc<dyn ModuleExecutor>)> {
        self.modules.iter().map(|(n, e)| (*n, e))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field(
                "modules",
                &self.modules.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            )
            .field("critical", &self.critical)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopModule;

    #[async_trait]
    impl ModuleExecutor for NoopModule {
        async fn run(&self, _entity: &Entity) -> Result<ResultCounts, ModuleFailure> {
            Ok(ResultCounts::default())
        }
    }

    #[test]
    fn registration_preserves_order() {
        let mut registry = ModuleRegistry::new();
        registry.register("website_discovery", Arc::new(NoopModule));
        registry.register_critical("site_crawl", Arc::new(NoopModule));
        registry.register("news_scan", Arc::new(NoopModule));

        let names: Vec<_> = registry.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["website_discovery", "site_crawl", "news_scan"]);
    }

    #[test]
    fn critical_set_is_data_driven() {
        let mut registry = ModuleRegistry::new();
        registry.register_critical("site_crawl", Arc::new(NoopModule));
        registry.register("news_scan", Arc::new(NoopModule));

        assert!(registry.is_critical("site_crawl"));
        assert!(!registry.is_critical("news_scan"));
        assert!(!registry.is_critical("unregistered"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = ModuleRegistry::new();
        registry.register("site_crawl", Arc::new(NoopModule));
        registry.register("site_crawl", Arc::new(NoopModule));
    }

    #[test]
    fn fetch_failure_carries_the_host() {
        let failure = ModuleFailure::fetch("connect timeout", "sources.example");
        assert_eq!(failure.failed_host.as_deref(), Some("sources.example"));
        assert_eq!(failure.to_string(), "connect timeout");
    }
}
