//! Capability-typed device handle.
//!
//! The only object application code touches: a thin façade over one
//! [`Adapter`], guaranteeing an identical call shape whether the underlying
//! device is local or remote.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::adapter::{Adapter, PropsCallback, StreamCallback};
use crate::capability::{Device, DeviceInterface};
use crate::error::{RigError, RigResult};

/// Client facade for one device, created once per built or connected device
/// and held for the rig's lifetime.
#[derive(Clone)]
pub struct DeviceHandle {
    uid: String,
    adapter: Arc<dyn Adapter>,
}

impl DeviceHandle {
    /// Wrap an adapter.
    pub fn new(uid: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            uid: uid.into(),
            adapter,
        }
    }

    /// The device uid.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// The concrete device object; present only for local devices.
    pub fn device(&self) -> Option<Arc<dyn Device>> {
        self.adapter.device()
    }

    /// Read one property.
    pub async fn get(&self, name: &str) -> RigResult<Value> {
        let props = self.adapter.get_props(&[name.to_string()]).await?;
        props
            .get(name)
            .cloned()
            .ok_or_else(|| RigError::Call(format!("property '{name}' missing from reply")))
    }

    /// Write one property.
    pub async fn set(&self, name: &str, value: Value) -> RigResult<()> {
        let mut props = Map::new();
        props.insert(name.to_string(), value);
        self.adapter.set_props(props).await
    }

    /// Write a batch of properties.
    pub async fn set_many(&self, props: Map<String, Value>) -> RigResult<()> {
        self.adapter.set_props(props).await
    }

    /// Invoke a command with positional arguments.
    pub async fn call(&self, command: &str, args: Vec<Value>) -> RigResult<Value> {
        self.adapter.run_command(command, args, Map::new()).await
    }

    /// Invoke a command with positional and named arguments.
    pub async fn call_with(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> RigResult<Value> {
        self.adapter.run_command(command, args, kwargs).await
    }

    /// Fetch the device's capability snapshot.
    pub async fn interface(&self) -> RigResult<DeviceInterface> {
        self.adapter.interface().await
    }

    /// Register a callback for property-change batches.
    pub async fn props_changed(&self, callback: PropsCallback) {
        self.adapter.on_props_changed(callback).await;
    }

    /// Register a callback for a named byte-stream.
    pub async fn subscribe(&self, stream: &str, callback: StreamCallback) {
        self.adapter.subscribe(stream, callback).await;
    }

    /// Remove all callbacks for a named byte-stream.
    pub async fn unsubscribe(&self, stream: &str) {
        self.adapter.unsubscribe(stream).await;
    }

    /// Confirm the device is reachable by fetching its interface once.
    pub async fn start(&self) -> RigResult<()> {
        self.adapter.interface().await.map(|_| ())
    }

    /// Close the underlying adapter.
    pub async fn close(&self) -> RigResult<()> {
        self.adapter.close().await
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle").field("uid", &self.uid).finish()
    }
}
