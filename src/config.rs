//! Rig configuration.
//!
//! Strongly-typed configuration loaded with Figment from a TOML file plus
//! `LABRIG_` environment overrides, then validated. Validation catches
//! semantic problems that parse fine: duplicate node names, a node claiming
//! a uid twice, a local node claiming a device with no build config.
//!
//! # Example
//!
//! ```toml
//! [rig]
//! name = "polarization-rig"
//! log_level = "info"
//!
//! [cluster]
//! connection_timeout = "10s"
//! provision_timeout = "30s"
//!
//! [devices.stage_a]
//! target = "mock_stage"
//! [devices.stage_a.init]
//! initial_position = 10.0
//! [devices.stage_a.defaults]
//! velocity = 2.0
//!
//! [devices.probe_a]
//! target = "mock_sensor"
//! [devices.probe_a.init]
//! source = { "$ref" = "stage_a" }
//!
//! [[nodes]]
//! name = "imaging"
//! hostname = "microscope-2"
//! devices = ["camera_1"]
//! [nodes.endpoints]
//! request = "microscope-2:5555"
//! publish = "microscope-2:5556"
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::builder::{BuildConfig, BuildGroupSpec};
use crate::cluster::{ClusterConfig, NodeConfig};
use crate::error::{RigError, RigResult};
use crate::net::SocketTuning;

/// Top-level rig configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings.
    #[serde(default)]
    pub rig: RigSection,
    /// Cluster timeouts.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Socket tuning overrides.
    #[serde(default)]
    pub transport: SocketTuning,
    /// Build configs for every device, keyed by uid.
    #[serde(default)]
    pub devices: HashMap<String, BuildConfig>,
    /// Distributed nodes; empty for a purely local rig.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigSection {
    /// Rig name, used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Logging format (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_name() -> String {
    "labrig".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RigSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl RigConfig {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables override configuration with prefix `LABRIG_`
    /// and `__` as the section separator, e.g.
    /// `LABRIG_RIG__LOG_LEVEL=debug`.
    pub fn load() -> RigResult<Self> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABRIG_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> RigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.rig.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.rig.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.rig.log_format.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.rig.log_format,
                valid_formats.join(", ")
            )));
        }

        let mut node_names = HashSet::new();
        let mut claimed: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !node_names.insert(&node.name) {
                return Err(RigError::Configuration(format!(
                    "Duplicate node name: {}",
                    node.name
                )));
            }
            if node.endpoints.request.is_empty() || node.endpoints.publish.is_empty() {
                return Err(RigError::Configuration(format!(
                    "Node '{}' must declare request and publish endpoints",
                    node.name
                )));
            }
            for uid in &node.devices {
                if !claimed.insert(uid.as_str()) {
                    return Err(RigError::Configuration(format!(
                        "Device '{uid}' is claimed by more than one node"
                    )));
                }
                if crate::cluster::is_local_hostname(&node.hostname)
                    && !self.devices.contains_key(uid)
                {
                    return Err(RigError::Configuration(format!(
                        "Local node '{}' claims device '{uid}' with no build config",
                        node.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build configs for the purely local devices — those not claimed by any
    /// node.
    pub fn local_device_spec(&self) -> BuildGroupSpec {
        let claimed: HashSet<&String> =
            self.nodes.iter().flat_map(|n| n.devices.iter()).collect();
        self.devices
            .iter()
            .filter(|(uid, _)| !claimed.contains(uid))
            .map(|(uid, config)| (uid.clone(), config.clone()))
            .collect()
    }

    /// The full build spec, including node-claimed devices.
    pub fn spec(&self) -> BuildGroupSpec {
        self.devices.clone()
    }

    /// The node config with the given name, if any.
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> RigConfig {
        toml::from_str(toml_str).expect("config parses")
    }

    #[test]
    fn test_minimal_config_validates() {
        let config = parse(
            r#"
            [devices.stage_a]
            target = "mock_stage"
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.rig.name, "labrig");
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn test_ref_values_survive_toml() {
        let config = parse(
            r#"
            [devices.probe_a]
            target = "mock_sensor"
            [devices.probe_a.init]
            source = { "$ref" = "stage_a" }
            "#,
        );
        let init = &config.devices["probe_a"].init;
        assert_eq!(
            crate::builder::reference_uid(&init["source"]),
            Some("stage_a")
        );
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let config = parse(
            r#"
            [[nodes]]
            name = "imaging"
            hostname = "remote-a"
            endpoints = { request = "remote-a:5555", publish = "remote-a:5556" }

            [[nodes]]
            name = "imaging"
            hostname = "remote-b"
            endpoints = { request = "remote-b:5555", publish = "remote-b:5556" }
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn test_local_node_requires_build_configs() {
        let config = parse(
            r#"
            [[nodes]]
            name = "bench"
            hostname = "localhost"
            devices = ["stage_a"]
            endpoints = { request = "127.0.0.1:5555", publish = "127.0.0.1:5556" }
            "#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stage_a"));
    }

    #[test]
    fn test_device_claimed_twice_rejected() {
        let config = parse(
            r#"
            [devices.stage_a]
            target = "mock_stage"

            [[nodes]]
            name = "bench"
            hostname = "localhost"
            devices = ["stage_a"]
            endpoints = { request = "127.0.0.1:5555", publish = "127.0.0.1:5556" }

            [[nodes]]
            name = "bench_2"
            hostname = "localhost"
            devices = ["stage_a"]
            endpoints = { request = "127.0.0.1:5557", publish = "127.0.0.1:5558" }
            "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_device_spec_excludes_node_devices() {
        let config = parse(
            r#"
            [devices.stage_a]
            target = "mock_stage"
            [devices.stage_b]
            target = "mock_stage"

            [[nodes]]
            name = "bench"
            hostname = "localhost"
            devices = ["stage_b"]
            endpoints = { request = "127.0.0.1:5555", publish = "127.0.0.1:5556" }
            "#,
        );
        let local = config.local_device_spec();
        assert!(local.contains_key("stage_a"));
        assert!(!local.contains_key("stage_b"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
            [rig]
            name = "bench-rig"

            [devices.stage_a]
            target = "mock_stage"
            "#,
        )
        .expect("write config");

        let config = RigConfig::load_from(&path).expect("load succeeds");
        assert_eq!(config.rig.name, "bench-rig");
        assert!(config.devices.contains_key("stage_a"));
    }

    #[test]
    fn test_cluster_timeouts_parse_as_durations() {
        let config = parse(
            r#"
            [cluster]
            connection_timeout = "2s"
            provision_timeout = "500ms"
            "#,
        );
        assert_eq!(
            config.cluster.connection_timeout,
            std::time::Duration::from_secs(2)
        );
        assert_eq!(
            config.cluster.provision_timeout,
            std::time::Duration::from_millis(500)
        );
    }
}
