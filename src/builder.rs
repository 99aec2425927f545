//! Object graph builder.
//!
//! Instantiates a set of devices from declarative build configs, resolving
//! inter-device references and isolating per-device failures. The contract:
//! [`build`] never raises for a per-device problem — it returns every device
//! that could be constructed plus a map of exactly which uids failed and why.
//!
//! A dependency is expressed as the explicit tagged object
//! `{"$ref": "<uid>"}` anywhere inside `init`, nested through arrays and
//! maps. A plain string that happens to equal another uid is a literal and
//! is never substituted.
//!
//! Resolution keeps an explicit arena of per-uid state (`built`, `errors`,
//! plus a `building` marker set) rather than relying on call-stack depth:
//! a uid found in `building` while its own subtree is being resolved is a
//! cycle, and every member of that cycle is reported as `Circular`. A uid
//! depending on an already-failed uid is reported as `Dependency` and is
//! never re-attempted.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::capability::Device;
use crate::registry::DeviceRegistry;

/// Key marking a value as a reference to another uid in the same spec.
pub const REF_KEY: &str = "$ref";

/// Declarative recipe for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Type identifier resolved through the [`DeviceRegistry`].
    pub target: String,
    /// Ordered constructor arguments; values may be scalars, lists, maps or
    /// `{"$ref": uid}` references to other devices in the same spec.
    #[serde(default)]
    pub init: Map<String, Value>,
    /// Property writes applied best-effort after construction.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

impl BuildConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            init: Map::new(),
            defaults: Map::new(),
        }
    }

    pub fn with_init(mut self, key: impl Into<String>, value: Value) -> Self {
        self.init.insert(key.into(), value);
        self
    }

    /// Add an init entry referencing another uid in the same spec.
    pub fn with_ref(mut self, key: impl Into<String>, uid: &str) -> Self {
        self.init.insert(key.into(), reference(uid));
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }
}

/// A group of build configs keyed by uid; uids are unique by map invariant.
pub type BuildGroupSpec = HashMap<String, BuildConfig>;

/// Construct a `{"$ref": uid}` reference value.
pub fn reference(uid: &str) -> Value {
    let mut map = Map::new();
    map.insert(REF_KEY.to_string(), Value::String(uid.to_string()));
    Value::Object(map)
}

/// Extract the referenced uid if the value is a reference object.
pub fn reference_uid(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.len() == 1 {
        map.get(REF_KEY)?.as_str()
    } else {
        None
    }
}

/// Why a uid failed to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildErrorKind {
    /// The target type identifier is not registered.
    Import,
    /// The factory ran and failed.
    Instantiation,
    /// A referenced uid failed to build.
    Dependency,
    /// The uid participates in a reference cycle.
    Circular,
}

/// Accumulated failure record for one uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildError {
    pub uid: String,
    pub kind: BuildErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl BuildError {
    fn new(uid: &str, kind: BuildErrorKind, message: impl Into<String>) -> Self {
        Self {
            uid: uid.to_string(),
            kind,
            message: message.into(),
            trace: None,
        }
    }
}

/// Outcome of one [`build`] invocation.
#[derive(Default)]
pub struct BuildReport {
    /// Successfully constructed devices by uid.
    pub built: HashMap<String, Arc<dyn Device>>,
    /// Failed uids with their failure records.
    pub errors: HashMap<String, BuildError>,
}

// =============================================================================
// Resolved init
// =============================================================================

/// One value from a resolved init map.
#[derive(Clone)]
pub enum ResolvedValue {
    /// A plain JSON value (no references inside).
    Value(Value),
    /// A reference, substituted with the built device.
    Device(Arc<dyn Device>),
    /// A list that contained at least one reference.
    List(Vec<ResolvedValue>),
    /// A map that contained at least one reference.
    Map(Vec<(String, ResolvedValue)>),
}

/// Init map with references substituted and the uid injected, handed to
/// device factories.
#[derive(Clone)]
pub struct ResolvedInit {
    uid: String,
    entries: Vec<(String, ResolvedValue)>,
}

impl ResolvedInit {
    pub(crate) fn resolve(
        uid: &str,
        init: &Map<String, Value>,
        built: &HashMap<String, Arc<dyn Device>>,
    ) -> Self {
        let mut entries: Vec<(String, ResolvedValue)> = init
            .iter()
            .map(|(key, value)| (key.clone(), resolve_value(value, built)))
            .collect();

        // Constructors always know their own id without the spec repeating it.
        if !init.contains_key("uid") {
            entries.push((
                "uid".to_string(),
                ResolvedValue::Value(Value::String(uid.to_string())),
            ));
        }

        Self {
            uid: uid.to_string(),
            entries,
        }
    }

    /// Build a resolved init directly, for factories invoked outside the
    /// builder (tests, standalone hosting).
    pub fn from_values(uid: &str, init: &Map<String, Value>) -> Self {
        Self::resolve(uid, init, &HashMap::new())
    }

    /// The uid being constructed.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// The plain JSON value for a field, if it is one.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.get(name)? {
            ResolvedValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.value(name)?.as_str()
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.value(name)?.as_f64()
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.value(name)?.as_bool()
    }

    /// The device a field references, if the field is a reference.
    pub fn opt_device(&self, name: &str) -> Option<Arc<dyn Device>> {
        match self.get(name)? {
            ResolvedValue::Device(device) => Some(device.clone()),
            _ => None,
        }
    }

    /// The device a field references; errors if the field is missing or not
    /// a reference.
    pub fn device(&self, name: &str) -> anyhow::Result<Arc<dyn Device>> {
        self.opt_device(name)
            .ok_or_else(|| anyhow::anyhow!("init field '{name}' must be a device reference"))
    }
}

fn resolve_value(value: &Value, built: &HashMap<String, Arc<dyn Device>>) -> ResolvedValue {
    if let Some(uid) = reference_uid(value) {
        if let Some(device) = built.get(uid) {
            return ResolvedValue::Device(device.clone());
        }
        return ResolvedValue::Value(value.clone());
    }

    match value {
        Value::Array(items) if contains_reference(value) => {
            ResolvedValue::List(items.iter().map(|v| resolve_value(v, built)).collect())
        }
        Value::Object(map) if contains_reference(value) => ResolvedValue::Map(
            map.iter()
                .map(|(key, v)| (key.clone(), resolve_value(v, built)))
                .collect(),
        ),
        other => ResolvedValue::Value(other.clone()),
    }
}

fn contains_reference(value: &Value) -> bool {
    if reference_uid(value).is_some() {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(contains_reference),
        Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

/// Collect every referenced uid inside a value, depth-first, in order.
fn collect_refs(value: &Value, out: &mut Vec<String>) {
    if let Some(uid) = reference_uid(value) {
        if !out.iter().any(|seen| seen == uid) {
            out.push(uid.to_string());
        }
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_refs(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, out);
            }
        }
        _ => {}
    }
}

// =============================================================================
// Build
// =============================================================================

/// Build every device in the spec, resolving dependencies first.
///
/// Returns all successfully constructed devices plus the accumulated errors;
/// one bad entry never prevents the rest of the spec from building. The
/// working sets are local to this call — the same spec must not be handed to
/// concurrent invocations expecting shared memoization.
pub async fn build(spec: &BuildGroupSpec, registry: &DeviceRegistry) -> BuildReport {
    let mut report = BuildReport::default();
    // The in-progress chain, outermost first. Membership marks a uid as
    // "currently building"; hitting a member again is a cycle.
    let mut building: Vec<String> = Vec::new();

    let mut uids: Vec<&String> = spec.keys().collect();
    uids.sort();

    for uid in uids {
        resolve_uid(uid.clone(), spec, registry, &mut report, &mut building).await;
    }

    report
}

fn resolve_uid<'a>(
    uid: String,
    spec: &'a BuildGroupSpec,
    registry: &'a DeviceRegistry,
    report: &'a mut BuildReport,
    building: &'a mut Vec<String>,
) -> BoxFuture<'a, ()> {
    async move {
        if report.built.contains_key(&uid) || report.errors.contains_key(&uid) {
            return;
        }

        if let Some(start) = building.iter().position(|b| *b == uid) {
            // Cycle: the chain from this uid's earlier frame down to here is
            // exactly the cycle. Mark every member and do not recurse further.
            for member in &building[start..] {
                report.errors.entry(member.clone()).or_insert_with(|| {
                    BuildError::new(
                        member,
                        BuildErrorKind::Circular,
                        format!("reference cycle detected while constructing '{uid}'"),
                    )
                });
            }
            return;
        }

        let Some(config) = spec.get(&uid) else {
            return;
        };

        building.push(uid.clone());

        let mut deps = Vec::new();
        for value in config.init.values() {
            collect_refs(value, &mut deps);
        }

        for dep in &deps {
            if !spec.contains_key(dep) {
                report.errors.entry(uid.clone()).or_insert_with(|| {
                    BuildError::new(
                        &uid,
                        BuildErrorKind::Dependency,
                        format!("init references unknown device '{dep}'"),
                    )
                });
                building.pop();
                return;
            }

            resolve_uid(dep.clone(), spec, registry, &mut *report, &mut *building).await;

            if report.errors.contains_key(&uid) {
                // Marked as a cycle member while resolving this dependency.
                building.pop();
                return;
            }

            if let Some(dep_error) = report.errors.get(dep) {
                let message =
                    format!("dependency '{dep}' failed to build: {}", dep_error.message);
                report
                    .errors
                    .entry(uid.clone())
                    .or_insert_with(|| BuildError::new(&uid, BuildErrorKind::Dependency, message));
                building.pop();
                return;
            }
        }

        let Some(factory) = registry.factory(&config.target) else {
            report.errors.insert(
                uid.clone(),
                BuildError::new(
                    &uid,
                    BuildErrorKind::Import,
                    format!("unknown device type '{}'", config.target),
                ),
            );
            building.pop();
            return;
        };

        let init = ResolvedInit::resolve(&uid, &config.init, &report.built);

        match factory(init) {
            Ok(device) => {
                apply_defaults(&uid, device.as_ref(), &config.defaults).await;
                building.pop();
                report.built.insert(uid, device);
            }
            Err(err) => {
                building.pop();
                report.errors.insert(
                    uid.clone(),
                    BuildError {
                        uid,
                        kind: BuildErrorKind::Instantiation,
                        message: format!("{err:#}"),
                        trace: Some(format!("{err:?}")),
                    },
                );
            }
        }
    }
    .boxed()
}

/// Apply `defaults` entries as best-effort property writes. A failure here is
/// logged only; it never reverts the successful build.
async fn apply_defaults(uid: &str, device: &dyn Device, defaults: &Map<String, Value>) {
    for (name, value) in defaults {
        if let Err(err) = device.descriptor().validate_write(name, value) {
            warn!(uid, property = %name, error = %err, "default value rejected");
            continue;
        }
        if let Err(err) = device.write_prop(name, value.clone()).await {
            warn!(uid, property = %name, error = %err, "default value was not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_spec_builds_nothing() {
        let report = tokio_test::block_on(build(
            &BuildGroupSpec::new(),
            &crate::registry::DeviceRegistry::new(),
        ));
        assert!(report.built.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_reference_detection() {
        assert_eq!(reference_uid(&reference("stage_1")), Some("stage_1"));
        assert_eq!(reference_uid(&json!("stage_1")), None);
        assert_eq!(reference_uid(&json!({"$ref": "a", "extra": 1})), None);
    }

    #[test]
    fn test_collect_refs_nested() {
        let value = json!({
            "inputs": [{"$ref": "a"}, "literal", {"inner": {"$ref": "b"}}],
            "again": {"$ref": "a"}
        });
        let mut refs = Vec::new();
        collect_refs(&value, &mut refs);
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_plain_string_is_not_a_dependency() {
        let config = BuildConfig::new("mock_stage").with_init("note", json!("stage_1"));
        let mut refs = Vec::new();
        for value in config.init.values() {
            collect_refs(value, &mut refs);
        }
        assert!(refs.is_empty());
    }

    #[test]
    fn test_resolved_init_injects_uid() {
        let init = Map::new();
        let resolved = ResolvedInit::from_values("stage_1", &init);
        assert_eq!(resolved.uid(), "stage_1");
        assert_eq!(resolved.str("uid"), Some("stage_1"));
    }

    #[test]
    fn test_resolved_init_keeps_explicit_uid() {
        let mut init = Map::new();
        init.insert("uid".to_string(), json!("custom"));
        let resolved = ResolvedInit::from_values("stage_1", &init);
        assert_eq!(resolved.str("uid"), Some("custom"));
    }
}
