//! Bundled device implementations.
//!
//! Mock devices for tests, demos and standalone hosting. Real hardware
//! drivers live outside this crate and plug in through the same
//! [`crate::capability::Device`] contract and a [`DeviceRegistry`]
//! registration.

mod mock;

pub use mock::{MockSensor, MockStage};

use once_cell::sync::Lazy;

use crate::registry::DeviceRegistry;

/// The registry of bundled device types, populated once at process start.
pub fn builtin_registry() -> DeviceRegistry {
    static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(|| {
        let mut registry = DeviceRegistry::new();
        registry.register("mock_stage", MockStage::from_init);
        registry.register("mock_sensor", MockSensor::from_init);
        registry
    });
    REGISTRY.clone()
}
