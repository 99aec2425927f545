//! Rig: the composition root.
//!
//! A [`Rig`] builds purely local devices directly, optionally starts a
//! [`ClusterManager`] for distributed nodes, merges both into one handle
//! map, and owns the shared lifecycle. `start()` completes even in the
//! presence of partial device failures — callers inspect
//! [`Rig::handles`], [`Rig::build_errors`] and [`Rig::node_status`] to know
//! what is actually usable. Only structurally fatal conditions (distributed
//! nodes configured but no network context obtainable) abort startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapter::LocalAdapter;
use crate::builder::{self, BuildError};
use crate::capability::Device;
use crate::cluster::{ClusterManager, NodeStatus};
use crate::config::RigConfig;
use crate::controller::DeviceController;
use crate::error::{RigError, RigResult};
use crate::handle::DeviceHandle;
use crate::net::NetContext;
use crate::registry::DeviceRegistry;

/// Extension hook invoked after a successful start, for post-start
/// validation of the assembled rig.
#[async_trait]
pub trait RigHook: Send + Sync {
    /// Inspect the started rig; an error aborts `start()` with a
    /// configuration error.
    async fn post_start(&self, rig: &Rig) -> anyhow::Result<()>;
}

/// Composition root owning devices, handles, the optional cluster and the
/// shared network context.
pub struct Rig {
    config: RigConfig,
    registry: DeviceRegistry,
    devices: HashMap<String, Arc<dyn Device>>,
    handles: HashMap<String, DeviceHandle>,
    handle_order: Vec<String>,
    build_errors: HashMap<String, BuildError>,
    cluster: Option<ClusterManager>,
    context: Option<Arc<NetContext>>,
    owns_context: bool,
    hook: Option<Arc<dyn RigHook>>,
    started: bool,
}

impl Rig {
    /// Create a rig from a validated configuration and a device registry.
    pub fn new(config: RigConfig, registry: DeviceRegistry) -> Self {
        Self {
            config,
            registry,
            devices: HashMap::new(),
            handles: HashMap::new(),
            handle_order: Vec::new(),
            build_errors: HashMap::new(),
            cluster: None,
            context: None,
            owns_context: false,
            hook: None,
            started: false,
        }
    }

    /// Use a caller-supplied network context. The rig will never terminate
    /// a context it did not create.
    pub fn with_context(mut self, context: Arc<NetContext>) -> Self {
        self.context = Some(context);
        self.owns_context = false;
        self
    }

    /// Install a post-start validation hook.
    pub fn with_hook(mut self, hook: Arc<dyn RigHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Bring the rig up: build local devices, pair them with controllers
    /// and handles, start the cluster if nodes are configured, and run the
    /// post-start hook.
    pub async fn start(&mut self) -> RigResult<()> {
        if self.started {
            return Ok(());
        }
        info!(rig = %self.config.rig.name, "rig starting");

        // Purely local devices: per-device failures are logged and recorded,
        // never fatal.
        let local_spec = self.config.local_device_spec();
        let report = builder::build(&local_spec, &self.registry).await;
        for (uid, err) in &report.errors {
            error!(uid = %uid, kind = ?err.kind, message = %err.message, "device build failed");
        }
        self.build_errors = report.errors;

        let mut uids: Vec<String> = report.built.keys().cloned().collect();
        uids.sort();
        for uid in uids {
            let Some(device) = report.built.get(&uid) else {
                continue;
            };
            let controller = DeviceController::new(device.clone());
            let adapter = LocalAdapter::new(controller);
            self.devices.insert(uid.clone(), device.clone());
            self.handles
                .insert(uid.clone(), DeviceHandle::new(&uid, adapter));
            self.handle_order.push(uid);
        }

        if !self.config.nodes.is_empty() {
            let context = match &self.context {
                Some(context) => context.clone(),
                None => {
                    let context = NetContext::with_tuning(self.config.transport.clone());
                    self.context = Some(context.clone());
                    self.owns_context = true;
                    context
                }
            };
            if context.is_terminated() {
                return Err(RigError::NoContext);
            }

            let mut cluster = ClusterManager::new(
                self.config.nodes.clone(),
                self.config.spec(),
                self.registry.clone(),
                self.config.cluster.clone(),
                context,
            );
            cluster.start().await?;

            for (uid, handle) in cluster.handles() {
                if self.handles.contains_key(uid) {
                    warn!(uid = %uid, "cluster handle shadows a local device, skipping");
                    continue;
                }
                self.handles.insert(uid.clone(), handle.clone());
                self.handle_order.push(uid.clone());
            }
            self.build_errors.extend(cluster.build_errors().clone());
            self.cluster = Some(cluster);
        }

        self.started = true;
        info!(
            rig = %self.config.rig.name,
            devices = self.handles.len(),
            failed = self.build_errors.len(),
            "rig started"
        );

        if let Some(hook) = self.hook.clone() {
            hook.post_start(self).await.map_err(|err| {
                RigError::Configuration(format!("post-start validation failed: {err:#}"))
            })?;
        }

        Ok(())
    }

    /// Tear the rig down: close every handle, stop the cluster, and
    /// terminate the network context only if this rig created it.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }

        for uid in self.handle_order.drain(..).rev() {
            if let Some(handle) = self.handles.remove(&uid) {
                if let Err(err) = handle.close().await {
                    warn!(uid = %uid, error = %err, "handle close failed");
                }
            }
        }
        self.handles.clear();

        if let Some(mut cluster) = self.cluster.take() {
            cluster.stop().await;
        }

        if self.owns_context {
            if let Some(context) = self.context.take() {
                context.terminate();
            }
            self.owns_context = false;
        }

        self.devices.clear();
        self.started = false;
        info!(rig = %self.config.rig.name, "rig stopped");
    }

    /// The merged `{uid -> handle}` map.
    pub fn handles(&self) -> &HashMap<String, DeviceHandle> {
        &self.handles
    }

    /// One handle by uid.
    pub fn handle(&self, uid: &str) -> Option<&DeviceHandle> {
        self.handles.get(uid)
    }

    /// The concrete device object for a locally built device. Remote
    /// devices have no in-process object, by design.
    pub fn get_device(&self, uid: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(uid).cloned()
    }

    /// Typed access to a locally built device.
    pub fn get_device_as<T: Device>(&self, uid: &str) -> Option<&T> {
        self.devices
            .get(uid)
            .and_then(|device| device.as_any().downcast_ref::<T>())
    }

    /// Build failures accumulated during start.
    pub fn build_errors(&self) -> &HashMap<String, BuildError> {
        &self.build_errors
    }

    /// Per-node start report; empty when no cluster is configured.
    pub fn node_status(&self) -> HashMap<String, NodeStatus> {
        self.cluster
            .as_ref()
            .map(|cluster| cluster.status().clone())
            .unwrap_or_default()
    }

    /// The shared network context, if one is in use.
    pub fn context(&self) -> Option<&Arc<NetContext>> {
        self.context.as_ref()
    }

    /// Whether this rig created (and therefore must terminate) the context.
    pub fn owns_context(&self) -> bool {
        self.owns_context
    }

    /// Whether the rig is currently started.
    pub fn is_started(&self) -> bool {
        self.started
    }
}
