//! Device Capability Model
//!
//! This module defines the contract a device implementation exposes to the
//! rest of the fabric: introspectable properties (with optional numeric
//! constraints) and commands (with validated parameter schemas). The fabric
//! consumes this contract — it never implements hardware behavior itself.
//!
//! Instead of reflection over getters and setters, every device declares a
//! static [`DeviceDescriptor`] built once at construction time:
//!
//! - `property name -> (label, units, min/max/step, streamable, writable)`
//! - `command name -> (label, parameter schema)`
//!
//! The descriptor drives two things:
//!
//! - **Validation**: [`DeviceDescriptor::validate_command`] and
//!   [`DeviceDescriptor::validate_write`] reject invalid input *before* any
//!   device code runs. Validation fails closed — a rejected call has no
//!   partial side effect.
//! - **Introspection**: [`DeviceDescriptor::interface`] renders a pure,
//!   serializable [`DeviceInterface`] snapshot, so a remote caller can
//!   discover capabilities without compile-time knowledge of the device type.
//!
//! # Design Philosophy
//!
//! The [`Device`] trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors at the implementation seam
//! - Carries no transport concerns whatsoever
//!
//! # Example
//!
//! ```rust,ignore
//! struct Shutter {
//!     uid: String,
//!     descriptor: DeviceDescriptor,
//!     open: tokio::sync::Mutex<bool>,
//! }
//!
//! impl Shutter {
//!     fn new(uid: &str) -> Self {
//!         let descriptor = DeviceDescriptor::new()
//!             .property(PropertySpec::new("open").label("Shutter open"))
//!             .command(CommandSpec::new("toggle"));
//!         Self { uid: uid.into(), descriptor, open: tokio::sync::Mutex::new(false) }
//!     }
//! }
//!
//! #[async_trait]
//! impl Device for Shutter {
//!     fn uid(&self) -> &str { &self.uid }
//!     fn descriptor(&self) -> &DeviceDescriptor { &self.descriptor }
//!     // read_prop / write_prop / run_command match on the declared names
//! #   fn as_any(&self) -> &dyn std::any::Any { self }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::error::{RigError, RigResult};
use crate::wire::{self, PropsResponse};

/// Unique identifier for a device.
///
/// Format: lowercase alphanumeric with underscores (e.g., "power_meter", "stage_2")
pub type DeviceUid = String;

// =============================================================================
// Interface snapshot types
// =============================================================================

/// Declared kind of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Any JSON number
    Number,
    /// Whole numbers only
    Integer,
    /// UTF-8 string
    String,
    /// Boolean
    Bool,
    /// Anything, including null
    Any,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::Number => value.is_number(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::String => value.is_string(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Any => true,
        }
    }
}

/// Schema for a single command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: None,
        }
    }

    /// Mark the parameter optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declared surface of one device property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Whether the device publishes this value continuously as a byte-stream.
    #[serde(default)]
    pub streamable: bool,
    #[serde(default)]
    pub writable: bool,
}

impl PropertySpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            description: None,
            units: None,
            min: None,
            max: None,
            step: None,
            streamable: false,
            writable: true,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Constrain the property to a numeric range.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn streamable(mut self) -> Self {
        self.streamable = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

/// Declared surface of one device command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            description: None,
            params: Vec::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Merge positional args and kwargs into a `name -> value` map following
    /// the declared parameter order. Assumes the input already passed
    /// [`DeviceDescriptor::validate_command`].
    pub fn bind(&self, args: &[Value], kwargs: &Map<String, Value>) -> Map<String, Value> {
        let mut bound = Map::new();
        for (index, param) in self.params.iter().enumerate() {
            if let Some(value) = args.get(index) {
                bound.insert(param.name.clone(), value.clone());
            } else if let Some(value) = kwargs.get(&param.name) {
                bound.insert(param.name.clone(), value.clone());
            }
        }
        bound
    }
}

/// Serializable snapshot of a device's declared commands and properties.
///
/// This is the payload of `GetInterface` replies: a remote caller discovers
/// capabilities from this structure alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInterface {
    pub uid: DeviceUid,
    pub properties: BTreeMap<String, PropertySpec>,
    pub commands: BTreeMap<String, CommandSpec>,
}

// =============================================================================
// Descriptor table
// =============================================================================

/// Static per-device capability table, built once at construction time.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptor {
    properties: Vec<PropertySpec>,
    commands: Vec<CommandSpec>,
}

impl DeviceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        self.commands.push(spec);
        self
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    pub fn property_spec(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn command_spec(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Render the serializable interface snapshot for a device uid.
    pub fn interface(&self, uid: &str) -> DeviceInterface {
        DeviceInterface {
            uid: uid.to_string(),
            properties: self
                .properties
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            commands: self
                .commands
                .iter()
                .map(|c| (c.name.clone(), c.clone()))
                .collect(),
        }
    }

    /// Validate a property write against the declared schema.
    ///
    /// Rejects unknown properties, writes to read-only properties, and
    /// numeric values outside a declared range. No device code runs on
    /// rejection.
    pub fn validate_write(&self, name: &str, value: &Value) -> RigResult<()> {
        let spec = self
            .property_spec(name)
            .ok_or_else(|| RigError::Parameter(format!("unknown property '{name}'")))?;

        if !spec.writable {
            return Err(RigError::Parameter(format!(
                "property '{name}' is read-only"
            )));
        }

        if spec.min.is_some() || spec.max.is_some() {
            let number = value.as_f64().ok_or_else(|| {
                RigError::Parameter(format!("property '{name}' expects a numeric value"))
            })?;
            if let Some(min) = spec.min {
                if number < min {
                    return Err(RigError::Parameter(format!(
                        "value {number} below minimum {min} for property '{name}'"
                    )));
                }
            }
            if let Some(max) = spec.max {
                if number > max {
                    return Err(RigError::Parameter(format!(
                        "value {number} above maximum {max} for property '{name}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate a command invocation against the declared parameter schema.
    ///
    /// Positional args bind to parameters in declaration order; kwargs bind
    /// by name. Rejects unknown commands, surplus or duplicate arguments,
    /// missing required parameters and kind mismatches.
    pub fn validate_command(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> RigResult<()> {
        let spec = self
            .command_spec(name)
            .ok_or_else(|| RigError::Parameter(format!("unknown command '{name}'")))?;

        if args.len() > spec.params.len() {
            return Err(RigError::Parameter(format!(
                "command '{name}' takes at most {} arguments, got {}",
                spec.params.len(),
                args.len()
            )));
        }

        for key in kwargs.keys() {
            if !spec.params.iter().any(|p| p.name == *key) {
                return Err(RigError::Parameter(format!(
                    "command '{name}' has no parameter '{key}'"
                )));
            }
        }

        for (index, param) in spec.params.iter().enumerate() {
            let positional = args.get(index);
            let named = kwargs.get(&param.name);

            let value = match (positional, named) {
                (Some(_), Some(_)) => {
                    return Err(RigError::Parameter(format!(
                        "parameter '{}' of command '{name}' given both positionally and by name",
                        param.name
                    )));
                }
                (Some(v), None) => Some(v),
                (None, Some(v)) => Some(v),
                (None, None) => None,
            };

            match value {
                Some(v) => {
                    if !param.kind.matches(v) {
                        return Err(RigError::Parameter(format!(
                            "parameter '{}' of command '{name}' expects {:?}",
                            param.name, param.kind
                        )));
                    }
                }
                None => {
                    if param.required {
                        return Err(RigError::Parameter(format!(
                            "missing required parameter '{}' for command '{name}'",
                            param.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Device trait
// =============================================================================

/// The contract one concrete device implements.
///
/// Implementations match on the names declared in their descriptor; the
/// controller layer guarantees that `write_prop` and `run_command` are only
/// invoked with input that already passed schema validation.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// The device's unique identifier within its rig.
    fn uid(&self) -> &str;

    /// The static capability table declared at construction time.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Read one property value.
    async fn read_prop(&self, name: &str) -> Result<Value>;

    /// Write one property value.
    async fn write_prop(&self, name: &str, value: Value) -> Result<()>;

    /// Execute one declared command.
    async fn run_command(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value>;

    /// Receive the publish sink once a controller wraps this device.
    ///
    /// Devices that emit byte-streams (continuous sensor frames and the like)
    /// keep the sink and feed it from their acquisition tasks; devices without
    /// streams ignore it.
    fn attach_publisher(&self, _publisher: PublishSink) {}

    /// Typed access for locally built devices.
    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// Publications
// =============================================================================

/// One published event: a topic plus an opaque payload.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Transport-agnostic publish handle given to devices by their controller.
///
/// Fan-out to sockets or in-process subscribers happens downstream; from the
/// device's point of view this is a fire-and-forget callback. Delivery is
/// best-effort by design.
#[derive(Debug, Clone)]
pub struct PublishSink {
    uid: DeviceUid,
    tx: broadcast::Sender<Publication>,
}

impl PublishSink {
    pub(crate) fn new(uid: DeviceUid, tx: broadcast::Sender<Publication>) -> Self {
        Self { uid, tx }
    }

    /// Emit a property-change batch on `{uid}/properties`.
    pub fn publish_props(&self, props: Map<String, Value>) {
        let body = PropsResponse::Success { props };
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        let _ = self.tx.send(Publication {
            topic: wire::properties_topic(&self.uid),
            payload,
        });
    }

    /// Emit opaque bytes on `{uid}/{stream}`.
    pub fn publish_stream(&self, stream: &str, payload: Vec<u8>) {
        let _ = self.tx.send(Publication {
            topic: wire::stream_topic(&self.uid, stream),
            payload,
        });
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage_descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new()
            .property(
                PropertySpec::new("position")
                    .units("mm")
                    .range(-100.0, 100.0),
            )
            .property(PropertySpec::new("serial").read_only())
            .command(
                CommandSpec::new("move_by")
                    .param(ParamSpec::new("distance", ParamKind::Number))
                    .param(ParamSpec::new("settle", ParamKind::Bool).optional()),
            )
    }

    #[test]
    fn test_write_within_range_accepted() {
        let desc = stage_descriptor();
        assert!(desc.validate_write("position", &json!(50.0)).is_ok());
    }

    #[test]
    fn test_write_out_of_range_rejected() {
        let desc = stage_descriptor();
        let err = desc.validate_write("position", &json!(150.0)).unwrap_err();
        assert!(err.to_string().contains("maximum"));
    }

    #[test]
    fn test_write_read_only_rejected() {
        let desc = stage_descriptor();
        assert!(desc.validate_write("serial", &json!("X1")).is_err());
    }

    #[test]
    fn test_write_unknown_property_rejected() {
        let desc = stage_descriptor();
        assert!(desc.validate_write("missing", &json!(1.0)).is_err());
    }

    #[test]
    fn test_command_positional_args() {
        let desc = stage_descriptor();
        assert!(desc
            .validate_command("move_by", &[json!(5.0)], &Map::new())
            .is_ok());
    }

    #[test]
    fn test_command_missing_required_param() {
        let desc = stage_descriptor();
        let err = desc
            .validate_command("move_by", &[], &Map::new())
            .unwrap_err();
        assert!(err.to_string().contains("distance"));
    }

    #[test]
    fn test_command_kind_mismatch() {
        let desc = stage_descriptor();
        assert!(desc
            .validate_command("move_by", &[json!("fast")], &Map::new())
            .is_err());
    }

    #[test]
    fn test_command_duplicate_binding_rejected() {
        let desc = stage_descriptor();
        let mut kwargs = Map::new();
        kwargs.insert("distance".to_string(), json!(1.0));
        assert!(desc
            .validate_command("move_by", &[json!(5.0)], &kwargs)
            .is_err());
    }

    #[test]
    fn test_command_unknown_kwarg_rejected() {
        let desc = stage_descriptor();
        let mut kwargs = Map::new();
        kwargs.insert("speed".to_string(), json!(1.0));
        assert!(desc.validate_command("move_by", &[], &kwargs).is_err());
    }

    #[test]
    fn test_bind_merges_args_and_kwargs() {
        let desc = stage_descriptor();
        let spec = desc.command_spec("move_by").unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("settle".to_string(), json!(true));

        let bound = spec.bind(&[json!(2.5)], &kwargs);
        assert_eq!(bound.get("distance"), Some(&json!(2.5)));
        assert_eq!(bound.get("settle"), Some(&json!(true)));
    }

    #[test]
    fn test_interface_snapshot_serializes() {
        let desc = stage_descriptor();
        let interface = desc.interface("stage_1");

        let encoded = serde_json::to_string(&interface).unwrap();
        let decoded: DeviceInterface = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, interface);
        assert_eq!(decoded.uid, "stage_1");
        assert!(decoded.properties.contains_key("position"));
        assert!(decoded.commands.contains_key("move_by"));
    }
}
