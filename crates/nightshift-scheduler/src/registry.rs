use std::collections::BTreeMap;
use std::sync::Arc;

use nightshift_core::config::{DELETE_RESOURCE_HANDLER, DELETE_WORKFLOW_HANDLER, MIGRATION_HANDLER};
use nightshift_core::{ConfigError, HandlerConfig};

use crate::{
    db::Connector,
    handlers::{CascadeDeleteHandler, DeleteHandler, Handler, MigrationHandler},
};

/// Builds a handler from its config section and the run's connector.
pub type HandlerFactory =
    Arc<dyn Fn(&HandlerConfig, Arc<Connector>) -> Result<Arc<dyn Handler>, ConfigError> + Send + Sync>;

/// Maps handler names to the factories that build them.
///
/// A name without its own factory falls back to the built-in handler of its
/// configured `kind`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the three built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DELETE_RESOURCE_HANDLER, |config, connector| {
            Ok(Arc::new(DeleteHandler::new(config, connector)?) as Arc<dyn Handler>)
        });
        registry.register(DELETE_WORKFLOW_HANDLER, |config, connector| {
            Ok(Arc::new(CascadeDeleteHandler::new(config, connector)?) as Arc<dyn Handler>)
        });
        registry.register(MIGRATION_HANDLER, |config, connector| {
            Ok(Arc::new(MigrationHandler::new(config, connector)?) as Arc<dyn Handler>)
        });
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&HandlerConfig, Arc<Connector>) -> Result<Arc<dyn Handler>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the handler for `config`.
    ///
    /// Looks up `config.name` first, then the built-in name of `config.kind`.
    pub fn resolve(
        &self,
        config: &HandlerConfig,
        connector: Arc<Connector>,
    ) -> Result<Arc<dyn Handler>, ConfigError> {
        let factory = self
            .factories
            .get(&config.name)
            .or_else(|| {
                config
                    .kind
                    .and_then(|kind| self.factories.get(kind.builtin_name()))
            })
            .ok_or_else(|| ConfigError::UnknownHandler {
                name: config.name.clone(),
            })?;
        factory(config, connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use nightshift_core::config::DbEndpoint;
    use nightshift_core::HandlerKind;

    fn connector() -> Arc<Connector> {
        Arc::new(Connector::new(DbEndpoint::new("unused.db"), None))
    }

    #[test]
    fn builtins_are_registered_by_name() {
        let registry = HandlerRegistry::with_builtins();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![DELETE_RESOURCE_HANDLER, DELETE_WORKFLOW_HANDLER, MIGRATION_HANDLER]
        );

        let config = HandlerConfig::new(DELETE_RESOURCE_HANDLER, "resources", "deleted = 1");
        let handler = registry.resolve(&config, connector()).unwrap();
        assert_eq!(handler.name(), DELETE_RESOURCE_HANDLER);
        assert_eq!(handler.operation(), Operation::Delete);
    }

    #[test]
    fn custom_name_falls_back_to_kind() {
        let registry = HandlerRegistry::with_builtins();
        let mut config = HandlerConfig::new("archive_invoices", "invoices", "paid = 1");
        config.kind = Some(HandlerKind::Migrate);
        config.target_table = Some("invoices_archive".into());

        let handler = registry.resolve(&config, connector()).unwrap();
        assert_eq!(handler.name(), "archive_invoices");
        assert_eq!(handler.operation(), Operation::CopyAndDelete);
    }

    #[test]
    fn unknown_name_without_kind_is_an_error() {
        let registry = HandlerRegistry::with_builtins();
        let config = HandlerConfig::new("mystery", "t", "1 = 1");
        assert!(matches!(
            registry.resolve(&config, connector()),
            Err(ConfigError::UnknownHandler { name }) if name == "mystery"
        ));
    }

    #[test]
    fn invalid_section_is_rejected_by_factory() {
        let registry = HandlerRegistry::with_builtins();
        let config = HandlerConfig::new(MIGRATION_HANDLER, "orders", "closed = 1");
        assert!(matches!(
            registry.resolve(&config, connector()),
            Err(ConfigError::MissingField { field: "target_table", .. })
        ));
    }
}
