//! Cluster manager.
//!
//! Owns a collection of nodes — each a named device group, local or remote.
//! Local nodes are built and hosted in-process; remote nodes are reached
//! through network adapters. A node that fails to come up is reported in its
//! [`NodeStatus`] and logged, but never aborts startup of the others.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::adapter::{Adapter, LocalAdapter, NetworkAdapter};
use crate::builder::{self, BuildError, BuildGroupSpec};
use crate::controller::DeviceController;
use crate::error::{RigError, RigResult};
use crate::handle::DeviceHandle;
use crate::net::NetContext;
use crate::registry::DeviceRegistry;
use crate::service::DeviceService;

/// Addresses one node exposes: a request/reply endpoint and a publish
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoints {
    pub request: String,
    pub publish: String,
}

/// Describes one cluster node: a named device group on some machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub hostname: String,
    pub endpoints: NodeEndpoints,
    /// Uids of the devices this node owns.
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Cluster-wide timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bound on each remote adapter's connect + first interface round-trip.
    #[serde(
        with = "humantime_serde",
        default = "default_connection_timeout"
    )]
    pub connection_timeout: Duration,
    /// Bound on node-level readiness after connection.
    #[serde(
        with = "humantime_serde",
        default = "default_provision_timeout"
    )]
    pub provision_timeout: Duration,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_provision_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_connection_timeout(),
            provision_timeout: default_provision_timeout(),
        }
    }
}

/// Lifecycle state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Built and hosted in this process.
    Hosted,
    /// Remote node, all declared devices answered.
    Connected,
    /// The node did not come up; see the message.
    Failed,
}

/// Report entry for one node after `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub hostname: String,
    pub local: bool,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub since: DateTime<Utc>,
}

/// Whether a hostname refers to the machine this process runs on.
pub fn is_local_hostname(name: &str) -> bool {
    if name == "localhost" || name == "127.0.0.1" || name == "::1" {
        return true;
    }
    match hostname::get() {
        Ok(own) => own.to_string_lossy() == name,
        Err(_) => false,
    }
}

/// Builds, hosts and connects the nodes of a cluster and aggregates the
/// resulting device handles.
pub struct ClusterManager {
    nodes: Vec<NodeConfig>,
    spec: BuildGroupSpec,
    registry: DeviceRegistry,
    config: ClusterConfig,
    context: Arc<NetContext>,
    services: Vec<DeviceService>,
    handles: HashMap<String, DeviceHandle>,
    handle_order: Vec<String>,
    build_errors: HashMap<String, BuildError>,
    status: HashMap<String, NodeStatus>,
}

impl ClusterManager {
    /// Create a manager; nothing runs until [`ClusterManager::start`].
    pub fn new(
        nodes: Vec<NodeConfig>,
        spec: BuildGroupSpec,
        registry: DeviceRegistry,
        config: ClusterConfig,
        context: Arc<NetContext>,
    ) -> Self {
        Self {
            nodes,
            spec,
            registry,
            config,
            context,
            services: Vec::new(),
            handles: HashMap::new(),
            handle_order: Vec::new(),
            build_errors: HashMap::new(),
            status: HashMap::new(),
        }
    }

    /// Start every node: local services first (deterministic, in config
    /// order), then remote connections. Per-node failures are recorded and
    /// logged; they do not abort startup of the other nodes.
    pub async fn start(&mut self) -> RigResult<()> {
        let nodes = self.nodes.clone();
        let (local, remote): (Vec<_>, Vec<_>) = nodes
            .into_iter()
            .partition(|node| is_local_hostname(&node.hostname));

        for node in &local {
            match self.host_node(node).await {
                Ok(()) => self.record(node, true, NodeState::Hosted, None),
                Err(err) => {
                    warn!(node = %node.name, error = %err, "local node failed to start");
                    self.record(node, true, NodeState::Failed, Some(err.to_string()));
                }
            }
        }

        for node in &remote {
            match self.connect_node(node).await {
                Ok(handles) => {
                    for (uid, handle) in handles {
                        self.handle_order.push(uid.clone());
                        self.handles.insert(uid, handle);
                    }
                    info!(node = %node.name, host = %node.hostname, "remote node connected");
                    self.record(node, false, NodeState::Connected, None);
                }
                Err(err) => {
                    warn!(node = %node.name, host = %node.hostname, error = %err,
                        "remote node failed to connect");
                    self.record(node, false, NodeState::Failed, Some(err.to_string()));
                }
            }
        }

        Ok(())
    }

    /// Build a local node's devices, host them behind a service, and expose
    /// them through in-process adapters.
    async fn host_node(&mut self, node: &NodeConfig) -> RigResult<()> {
        let mut node_spec = BuildGroupSpec::new();
        for uid in &node.devices {
            match self.spec.get(uid) {
                Some(config) => {
                    node_spec.insert(uid.clone(), config.clone());
                }
                None => warn!(node = %node.name, uid = %uid, "node claims a device with no build config"),
            }
        }

        let report = builder::build(&node_spec, &self.registry).await;
        for (uid, err) in &report.errors {
            warn!(node = %node.name, uid = %uid, kind = ?err.kind, message = %err.message,
                "device build failed");
        }
        self.build_errors.extend(report.errors);

        let mut controllers = HashMap::new();
        for (uid, device) in report.built {
            controllers.insert(uid, DeviceController::new(device));
        }

        let service = DeviceService::bind(
            &node.endpoints.request,
            &node.endpoints.publish,
            controllers.clone(),
        )
        .await?;

        let mut uids: Vec<&String> = controllers.keys().collect();
        uids.sort();
        for uid in uids {
            let adapter = LocalAdapter::new(controllers[uid].clone());
            self.handle_order.push(uid.clone());
            self.handles
                .insert(uid.clone(), DeviceHandle::new(uid, adapter));
        }

        info!(node = %node.name, request = %service.request_addr(),
            publish = %service.publish_addr(), "local node hosted");
        self.services.push(service);
        Ok(())
    }

    /// Connect every declared device of a remote node.
    ///
    /// Phase one bounds each adapter's connect + first interface round-trip
    /// by `connection_timeout`; phase two re-polls stragglers until the
    /// `provision_timeout` deadline. All adapters are closed again if the
    /// node does not become ready.
    async fn connect_node(
        &self,
        node: &NodeConfig,
    ) -> RigResult<HashMap<String, DeviceHandle>> {
        let connection_timeout = self.config.connection_timeout;

        let connects = node.devices.iter().map(|uid| {
            let endpoints = node.endpoints.clone();
            let context = self.context.clone();
            async move {
                let adapter = NetworkAdapter::connect(
                    uid,
                    &endpoints.request,
                    &endpoints.publish,
                    &context,
                )
                .await?;
                let ready = matches!(
                    timeout(connection_timeout, adapter.interface()).await,
                    Ok(Ok(_))
                );
                Ok::<_, RigError>((uid.clone(), adapter, ready))
            }
        });

        let mut adapters: Vec<(String, Arc<NetworkAdapter>, bool)> = Vec::new();
        let mut first_error: Option<RigError> = None;
        for result in join_all(connects).await {
            match result {
                Ok(entry) => adapters.push(entry),
                Err(err) => first_error = Some(err),
            }
        }

        if let Some(err) = first_error {
            close_all(&adapters).await;
            return Err(err);
        }

        let deadline = tokio::time::Instant::now() + self.config.provision_timeout;
        loop {
            let pending: Vec<String> = adapters
                .iter()
                .filter(|(_, _, ready)| !ready)
                .map(|(uid, _, _)| uid.clone())
                .collect();
            if pending.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                close_all(&adapters).await;
                return Err(RigError::Transport(format!(
                    "node '{}' not ready: devices {pending:?} did not answer",
                    node.name
                )));
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
            for (_, adapter, ready) in &mut adapters {
                if !*ready {
                    *ready = adapter.interface().await.is_ok();
                }
            }
        }

        Ok(adapters
            .into_iter()
            .map(|(uid, adapter, _)| {
                let handle = DeviceHandle::new(&uid, adapter);
                (uid, handle)
            })
            .collect())
    }

    fn record(&mut self, node: &NodeConfig, local: bool, state: NodeState, message: Option<String>) {
        self.status.insert(
            node.name.clone(),
            NodeStatus {
                name: node.name.clone(),
                hostname: node.hostname.clone(),
                local,
                state,
                message,
                since: Utc::now(),
            },
        );
    }

    /// The merged `{uid -> handle}` map across all nodes.
    pub fn handles(&self) -> &HashMap<String, DeviceHandle> {
        &self.handles
    }

    /// Build failures accumulated while hosting local nodes.
    pub fn build_errors(&self) -> &HashMap<String, BuildError> {
        &self.build_errors
    }

    /// Per-node start report.
    pub fn status(&self) -> &HashMap<String, NodeStatus> {
        &self.status
    }

    /// Close every handle and stop every hosted service, in reverse order.
    pub async fn stop(&mut self) {
        for uid in self.handle_order.drain(..).rev() {
            if let Some(handle) = self.handles.remove(&uid) {
                if let Err(err) = handle.close().await {
                    warn!(uid = %uid, error = %err, "handle close failed");
                }
            }
        }
        self.handles.clear();

        for service in self.services.drain(..).rev() {
            service.stop().await;
        }
    }
}

async fn close_all(adapters: &[(String, Arc<NetworkAdapter>, bool)]) {
    for (uid, adapter, _) in adapters {
        if let Err(err) = adapter.close().await {
            warn!(uid = %uid, error = %err, "adapter close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_names_are_local() {
        assert!(is_local_hostname("localhost"));
        assert!(is_local_hostname("127.0.0.1"));
        assert!(!is_local_hostname("microscope-42.example.org"));
    }

    #[test]
    fn test_cluster_config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.provision_timeout, Duration::from_secs(30));
    }
}
