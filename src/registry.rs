//! Device type registry.
//!
//! Maps a declarative type identifier (the `target` field of a build config)
//! to a factory function producing a [`Device`]. The registry is populated
//! explicitly, once, at process start — declarative construction without any
//! runtime reflection. An identifier with no registered factory surfaces as
//! an `Import` build error.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register("mock_stage", MockStage::from_init);
//! registry.register("shutter", |init| Ok(Arc::new(Shutter::from_init(init)?) as Arc<dyn Device>));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::ResolvedInit;
use crate::capability::Device;

/// Factory function signature for creating devices from resolved init maps.
///
/// Takes the resolved init (dependency references already substituted with
/// built devices, uid injected), returns the constructed device. A factory
/// error becomes an `Instantiation` build error for that uid.
pub type DeviceFactory =
    Arc<dyn Fn(ResolvedInit) -> anyhow::Result<Arc<dyn Device>> + Send + Sync>;

/// Registry mapping type identifiers to device factories.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a type identifier.
    ///
    /// A later registration for the same identifier replaces the earlier one.
    pub fn register<F>(&mut self, target: impl Into<String>, factory: F)
    where
        F: Fn(ResolvedInit) -> anyhow::Result<Arc<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(target.into(), Arc::new(factory));
    }

    /// Look up the factory for a type identifier.
    pub fn factory(&self, target: &str) -> Option<&DeviceFactory> {
        self.factories.get(target)
    }

    /// Whether a type identifier is registered.
    pub fn contains(&self, target: &str) -> bool {
        self.factories.contains_key(target)
    }

    /// All registered type identifiers.
    pub fn targets(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockStage;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.register("mock_stage", MockStage::from_init);

        assert!(registry.contains("mock_stage"));
        assert!(registry.factory("mock_stage").is_some());
        assert!(registry.factory("laser").is_none());
    }

    #[test]
    fn test_targets_lists_registered_identifiers() {
        let mut registry = DeviceRegistry::new();
        registry.register("mock_stage", MockStage::from_init);

        assert_eq!(registry.targets(), vec!["mock_stage"]);
    }
}
