//! Integration tests for the object graph builder.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use labrig::builder::{build, BuildConfig, BuildErrorKind, BuildGroupSpec};
use labrig::capability::Device;
use labrig::devices::{builtin_registry, MockSensor};

fn spec(entries: Vec<(&str, BuildConfig)>) -> BuildGroupSpec {
    entries
        .into_iter()
        .map(|(uid, config)| (uid.to_string(), config))
        .collect()
}

#[tokio::test]
async fn test_ref_free_spec_builds_every_device() {
    let spec = spec(vec![
        ("stage_a", BuildConfig::new("mock_stage")),
        ("stage_b", BuildConfig::new("mock_stage")),
        ("probe_a", BuildConfig::new("mock_sensor")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.built.len(), 3);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_dependency_builds_in_order_and_shares_instance() {
    let spec = spec(vec![
        (
            "a",
            BuildConfig::new("mock_stage").with_init("initial_position", json!(5.0)),
        ),
        ("b", BuildConfig::new("mock_sensor").with_ref("source", "a")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    assert_eq!(report.built.len(), 2);

    let sensor = report.built["b"]
        .as_any()
        .downcast_ref::<MockSensor>()
        .expect("b is a MockSensor");
    let source = sensor.source().expect("dependency was wired");
    assert!(Arc::ptr_eq(&source, &report.built["a"]));
}

#[tokio::test]
async fn test_uid_is_injected_into_init() {
    let spec = spec(vec![("stage_a", BuildConfig::new("mock_stage"))]);
    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.built["stage_a"].uid(), "stage_a");
}

#[tokio::test]
async fn test_two_cycle_reports_both_as_circular() {
    let spec = spec(vec![
        ("a", BuildConfig::new("mock_sensor").with_ref("source", "b")),
        ("b", BuildConfig::new("mock_sensor").with_ref("source", "a")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.built.is_empty());
    assert_eq!(report.errors.len(), 2);
    assert_eq!(report.errors["a"].kind, BuildErrorKind::Circular);
    assert_eq!(report.errors["b"].kind, BuildErrorKind::Circular);
}

#[tokio::test]
async fn test_three_cycle_reports_every_member_as_circular() {
    let spec = spec(vec![
        ("a", BuildConfig::new("mock_sensor").with_ref("source", "b")),
        ("b", BuildConfig::new("mock_sensor").with_ref("source", "c")),
        ("c", BuildConfig::new("mock_sensor").with_ref("source", "a")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.built.is_empty());
    for uid in ["a", "b", "c"] {
        assert_eq!(
            report.errors[uid].kind,
            BuildErrorKind::Circular,
            "uid {uid}"
        );
    }
}

#[tokio::test]
async fn test_dependent_outside_a_cycle_gets_dependency_error() {
    let spec = spec(vec![
        ("a", BuildConfig::new("mock_sensor").with_ref("source", "b")),
        ("b", BuildConfig::new("mock_sensor").with_ref("source", "a")),
        ("c", BuildConfig::new("mock_sensor").with_ref("source", "a")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.errors["a"].kind, BuildErrorKind::Circular);
    assert_eq!(report.errors["b"].kind, BuildErrorKind::Circular);
    assert_eq!(report.errors["c"].kind, BuildErrorKind::Dependency);
}

#[tokio::test]
async fn test_unknown_target_is_import_error() {
    let spec = spec(vec![("laser_1", BuildConfig::new("warp_drive"))]);

    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.errors["laser_1"].kind, BuildErrorKind::Import);
    assert!(report.errors["laser_1"].message.contains("warp_drive"));
}

#[tokio::test]
async fn test_dependency_error_names_the_failed_uid() {
    let spec = spec(vec![
        ("y", BuildConfig::new("warp_drive")),
        ("x", BuildConfig::new("mock_sensor").with_ref("source", "y")),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.errors["y"].kind, BuildErrorKind::Import);
    assert_eq!(report.errors["x"].kind, BuildErrorKind::Dependency);
    assert!(report.errors["x"].message.contains("'y'"));
    assert!(!report.built.contains_key("x"));
}

#[tokio::test]
async fn test_reference_to_unknown_uid_is_dependency_error() {
    let spec = spec(vec![(
        "probe_a",
        BuildConfig::new("mock_sensor").with_ref("source", "ghost"),
    )]);

    let report = build(&spec, &builtin_registry()).await;
    assert_eq!(report.errors["probe_a"].kind, BuildErrorKind::Dependency);
    assert!(report.errors["probe_a"].message.contains("ghost"));
}

#[tokio::test]
async fn test_instantiation_failure_preserves_message_and_trace() {
    let mut registry = builtin_registry();
    registry.register("flaky", |_init| -> anyhow::Result<Arc<dyn Device>> {
        anyhow::bail!("port /dev/ttyUSB7 did not answer")
    });

    let spec = spec(vec![("flaky_1", BuildConfig::new("flaky"))]);
    let report = build(&spec, &registry).await;

    let err = &report.errors["flaky_1"];
    assert_eq!(err.kind, BuildErrorKind::Instantiation);
    assert!(err.message.contains("did not answer"));
    assert!(err.trace.is_some());
}

#[tokio::test]
async fn test_bad_default_leaves_device_built() {
    let spec = spec(vec![(
        "stage_a",
        BuildConfig::new("mock_stage").with_default("nonexistent", json!(1.0)),
    )]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.built.contains_key("stage_a"));
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_defaults_are_applied_after_construction() {
    let spec = spec(vec![(
        "stage_a",
        BuildConfig::new("mock_stage").with_default("velocity", json!(2.5)),
    )]);

    let report = build(&spec, &builtin_registry()).await;
    let velocity = report.built["stage_a"]
        .read_prop("velocity")
        .await
        .expect("velocity readable");
    assert_eq!(velocity, json!(2.5));
}

#[tokio::test]
async fn test_plain_string_equal_to_uid_is_a_literal() {
    let spec = spec(vec![
        ("a", BuildConfig::new("mock_stage")),
        (
            "b",
            BuildConfig::new("mock_sensor").with_init("note", json!("a")),
        ),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.errors.is_empty());

    let sensor = report.built["b"]
        .as_any()
        .downcast_ref::<MockSensor>()
        .expect("b is a MockSensor");
    assert!(sensor.source().is_none());
}

#[tokio::test]
async fn test_one_bad_entry_does_not_stop_the_rest() {
    let mut entries = HashMap::new();
    for index in 0..5 {
        entries.insert(
            format!("stage_{index}"),
            BuildConfig::new("mock_stage"),
        );
    }
    entries.insert("broken".to_string(), BuildConfig::new("warp_drive"));

    let report = build(&entries, &builtin_registry()).await;
    assert_eq!(report.built.len(), 5);
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn test_nested_references_inside_lists_and_maps() {
    let spec = spec(vec![
        ("a", BuildConfig::new("mock_stage")),
        (
            "b",
            BuildConfig::new("mock_sensor").with_init(
                "chain",
                json!([{ "$ref": "a" }, {"extra": {"$ref": "a"}}]),
            ),
        ),
    ]);

    let report = build(&spec, &builtin_registry()).await;
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    assert_eq!(report.built.len(), 2);
}
