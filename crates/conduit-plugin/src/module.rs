//! Plugin modules
//!
//! A [`Module`] is the in-memory form of a loaded code unit: a set of named
//! entry points. Two names are reserved for lifecycle hooks.

use std::collections::BTreeMap;

use crate::entry::{EntryDescriptor, EntryPoint};

/// Entry point run once after a plugin is loaded
pub const INITIALIZE: &str = "initialize";

/// Entry point run once before a plugin is unloaded
pub const CLEANUP: &str = "cleanup";

/// A set of named entry points
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    entries: BTreeMap<String, EntryPoint>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Add an entry point (builder style)
    pub fn with(mut self, name: impl Into<String>, entry: EntryPoint) -> Self {
        self.insert(name, entry);
        self
    }

    /// Add an entry point, returning the one it replaced
    pub fn insert(&mut self, name: impl Into<String>, entry: EntryPoint) -> Option<EntryPoint> {
        self.entries.insert(name.into(), entry)
    }

    pub fn resolve(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.get(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names and shapes of every entry point, sorted by name
    pub fn descriptors(&self) -> Vec<EntryDescriptor> {
        self.entries
            .iter()
            .map(|(name, entry)| EntryDescriptor {
                name: name.clone(),
                shape: entry.shape(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Shape;
    use serde_json::json;

    #[test]
    fn test_module_resolve_and_describe() {
        let module = Module::new("demo")
            .with("zeta", EntryPoint::plain(|_| Ok(json!(null))))
            .with("alpha", EntryPoint::sequence(|_| Ok(Vec::new())));

        assert_eq!(module.name(), "demo");
        assert_eq!(module.len(), 2);
        assert!(module.resolve("alpha").is_some());
        assert!(module.resolve("missing").is_none());

        let descriptors = module.descriptors();
        assert_eq!(descriptors[0].name, "alpha");
        assert_eq!(descriptors[0].shape, Shape::Sequence);
        assert_eq!(descriptors[1].name, "zeta");
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut module = Module::new("demo");
        assert!(module.insert("f", EntryPoint::plain(|_| Ok(json!(1)))).is_none());
        let previous = module.insert("f", EntryPoint::deferred(|_| async { Ok(json!(2)) }));
        assert_eq!(previous.map(|e| e.shape()), Some(Shape::Plain));
        assert_eq!(module.resolve("f").map(|e| e.shape()), Some(Shape::Deferred));
    }
}
