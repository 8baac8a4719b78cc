//! Builtin module catalogue

use std::collections::BTreeMap;
use std::sync::Arc;

use conduit_plugin::Module;

type ModuleFactory = Arc<dyn Fn() -> Module + Send + Sync>;

/// Modules compiled into the host, by name
///
/// Each load instantiates a fresh [`Module`], so no two plugin instances share
/// a code unit.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, ModuleFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a module factory (builder style)
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn instantiate(&self, name: &str) -> Option<Module> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_instantiate() {
        let catalog = PluginCatalog::new()
            .with("b", || Module::new("b"))
            .with("a", || Module::new("a"));

        assert_eq!(catalog.names(), vec!["a", "b"]);
        assert_eq!(catalog.instantiate("a").map(|m| m.name().to_string()), Some("a".into()));
        assert!(catalog.instantiate("c").is_none());
    }
}
