//! Uniform device access adapters.
//!
//! An [`Adapter`] is the client-side access object for one device. The two
//! implementations — [`LocalAdapter`] for a co-located controller and
//! [`NetworkAdapter`] for a remote one — present an identical surface, so
//! application code never knows where a device lives.
//!
//! Change notifications and byte-streams are delivered to registered
//! callbacks. A callback that panics is caught and logged per-callback; one
//! faulty subscriber never blocks delivery to the others or kills the
//! delivery loop.

mod local;
mod network;

pub use local::LocalAdapter;
pub use network::NetworkAdapter;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::capability::{Device, DeviceInterface};
use crate::error::RigResult;
use crate::wire::{self, PropsResponse};

/// Callback invoked with every property-change batch for a device.
pub type PropsCallback = Arc<dyn Fn(&PropsResponse) + Send + Sync>;

/// Callback invoked with `(topic, payload)` for a subscribed byte-stream.
pub type StreamCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Uniform access object for one device, local or remote.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The device uid this adapter serves.
    fn uid(&self) -> &str;

    /// The concrete device object; present only for local adapters.
    fn device(&self) -> Option<Arc<dyn Device>> {
        None
    }

    /// Execute a declared command.
    async fn run_command(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> RigResult<Value>;

    /// Read a batch of properties; an empty name list reads all of them.
    async fn get_props(&self, names: &[String]) -> RigResult<Map<String, Value>>;

    /// Write a batch of properties.
    async fn set_props(&self, props: Map<String, Value>) -> RigResult<()>;

    /// Fetch the device's capability snapshot.
    async fn interface(&self) -> RigResult<DeviceInterface>;

    /// Register a callback for property-change batches.
    async fn on_props_changed(&self, callback: PropsCallback);

    /// Register a callback for a named byte-stream.
    async fn subscribe(&self, stream: &str, callback: StreamCallback);

    /// Remove all callbacks for a named byte-stream.
    async fn unsubscribe(&self, stream: &str);

    /// Stop notification delivery and release transport resources.
    ///
    /// Idempotent; after `close()` returns no further callback runs.
    async fn close(&self) -> RigResult<()>;
}

/// Registered callbacks for one adapter.
#[derive(Default)]
pub(crate) struct CallbackSet {
    props: Vec<PropsCallback>,
    streams: HashMap<String, Vec<StreamCallback>>,
}

impl CallbackSet {
    pub(crate) fn add_props(&mut self, callback: PropsCallback) {
        self.props.push(callback);
    }

    pub(crate) fn add_stream(&mut self, topic: String, callback: StreamCallback) {
        self.streams.entry(topic).or_default().push(callback);
    }

    pub(crate) fn remove_stream(&mut self, topic: &str) {
        self.streams.remove(topic);
    }
}

/// Route one publication to the matching callbacks.
///
/// `{uid}/properties` is parsed as a props batch for every props callback;
/// any other `{uid}/…` topic goes verbatim to its stream subscribers;
/// foreign topics are ignored.
pub(crate) fn dispatch_publication(
    uid: &str,
    callbacks: &CallbackSet,
    topic: &str,
    payload: &[u8],
) {
    if topic == wire::properties_topic(uid) {
        let update: PropsResponse = match serde_json::from_slice(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(uid, error = %err, "dropping malformed props publication");
                return;
            }
        };
        for callback in &callbacks.props {
            guard_callback(uid, topic, || callback(&update));
        }
        return;
    }

    if topic.starts_with(&format!("{uid}/")) {
        if let Some(subscribers) = callbacks.streams.get(topic) {
            for callback in subscribers {
                guard_callback(uid, topic, || callback(topic, payload));
            }
        }
    }
}

/// Run one callback, containing a panic so the remaining callbacks and the
/// delivery loop keep running.
fn guard_callback(uid: &str, topic: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!(uid, topic, "subscriber callback panicked");
    }
}
