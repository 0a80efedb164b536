//! Executor registry: executors resolved by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::RunnerConfig;
use crate::error::ExecutorError;
use crate::executor::{Executor, LocalExecutor};
use crate::settings::ExecutorConfig;

/// Builds an executor from its job-level config and the process config.
pub type ExecutorFactory =
    fn(&ExecutorConfig, &RunnerConfig) -> Result<Arc<dyn Executor>, ExecutorError>;

/// Constructed once at start-up and shared with every runner.
#[derive(Clone)]
pub struct ExecutorRegistry {
    factories: BTreeMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `local` executor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", LocalExecutor::from_config);
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, factory: ExecutorFactory) {
        let id = id.into();
        debug!("Registered executor '{}'", id);
        self.factories.insert(id, factory);
    }

    pub fn create(
        &self,
        config: &ExecutorConfig,
        runner: &RunnerConfig,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let factory = self
            .factories
            .get(config.id())
            .ok_or_else(|| ExecutorError::UnknownExecutor(config.id().to_string()))?;
        factory(config, runner)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::LocalExecutorOptions;

    #[test]
    fn test_defaults_resolve_local() {
        let registry = ExecutorRegistry::with_defaults();
        assert_eq!(registry.ids(), vec!["local"]);
        let executor = registry
            .create(
                &ExecutorConfig::Local(LocalExecutorOptions {
                    max_threads: Some(2),
                    output_buffer_lines: None,
                }),
                &RunnerConfig::default(),
            )
            .unwrap();
        assert_eq!(executor.id(), "local");
        assert_eq!(executor.max_threads(), Some(2));
    }

    #[test]
    fn test_unknown_executor() {
        let registry = ExecutorRegistry::with_defaults();
        let config = ExecutorConfig::Custom {
            id: "cluster".to_string(),
            options: serde_json::Value::Null,
        };
        let err = registry
            .create(&config, &RunnerConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ExecutorError::UnknownExecutor(id) if id == "cluster"));
    }

    #[test]
    fn test_register_alias() {
        let mut registry = ExecutorRegistry::new();
        registry.register("nearby", LocalExecutor::from_config);
        assert!(registry.contains("nearby"));
        let config = ExecutorConfig::Custom {
            id: "nearby".to_string(),
            options: serde_json::json!({"output_buffer_lines": 5}),
        };
        let executor = registry.create(&config, &RunnerConfig::default()).unwrap();
        assert_eq!(executor.output_buffer_lines(), 5);
    }
}
