//! Integration tests for rig and cluster lifecycle behavior.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;

use serde_json::{json, Map};
use serial_test::serial;

use labrig::builder::{self, BuildErrorKind, ResolvedInit};
use labrig::cluster::NodeState;
use labrig::config::RigConfig;
use labrig::controller::DeviceController;
use labrig::devices::{builtin_registry, MockStage};
use labrig::net::NetContext;
use labrig::rig::Rig;
use labrig::service::DeviceService;

fn parse(toml_str: &str) -> RigConfig {
    let config: RigConfig = toml::from_str(toml_str).expect("config parses");
    config.validate().expect("config validates");
    config
}

/// Reserve a currently-free loopback port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind succeeds");
    let port = listener.local_addr().expect("addr available").port();
    drop(listener);
    port
}

#[tokio::test]
#[serial]
async fn test_local_rig_lifecycle() {
    let config = parse(
        r#"
        [devices.stage_a]
        target = "mock_stage"
        [devices.stage_a.init]
        initial_position = 10.0
        "#,
    );

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("start succeeds");

    assert_eq!(rig.handles().len(), 1);
    assert!(rig.build_errors().is_empty());
    assert!(rig.node_status().is_empty());

    // The concrete object is reachable for locally built devices.
    assert!(rig.get_device("stage_a").is_some());
    let stage = rig
        .get_device_as::<MockStage>("stage_a")
        .expect("typed access works");
    assert_eq!(stage.position().await, 10.0);

    // Calls go through the handle.
    let handle = rig.handle("stage_a").expect("handle exists");
    assert_eq!(handle.get("position").await.expect("get works"), json!(10.0));
    handle
        .call("move_by", vec![json!(2.0)])
        .await
        .expect("command works");
    assert_eq!(handle.get("position").await.expect("get works"), json!(12.0));

    // A purely local rig owns no network context.
    assert!(!rig.owns_context());
    assert!(rig.context().is_none());

    rig.stop().await;
    assert!(!rig.is_started());
    assert!(rig.context().is_none());
}

#[tokio::test]
#[serial]
async fn test_partial_build_failure_does_not_abort_start() {
    let config = parse(
        r#"
        [devices.stage_a]
        target = "mock_stage"
        [devices.broken]
        target = "warp_drive"
        "#,
    );

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("start completes despite failure");

    assert!(rig.handles().contains_key("stage_a"));
    assert!(!rig.handles().contains_key("broken"));
    assert_eq!(rig.build_errors()["broken"].kind, BuildErrorKind::Import);

    rig.stop().await;
}

#[tokio::test]
#[serial]
async fn test_cluster_hosts_local_node_and_owns_context() {
    let request_port = free_port();
    let publish_port = free_port();
    let config = parse(&format!(
        r#"
        [devices.stage_a]
        target = "mock_stage"
        [devices.stage_b]
        target = "mock_stage"

        [[nodes]]
        name = "bench"
        hostname = "localhost"
        devices = ["stage_b"]
        endpoints = {{ request = "127.0.0.1:{request_port}", publish = "127.0.0.1:{publish_port}" }}
        "#
    ));

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("start succeeds");

    assert!(rig.handles().contains_key("stage_a"));
    assert!(rig.handles().contains_key("stage_b"));
    assert_eq!(rig.node_status()["bench"].state, NodeState::Hosted);

    // Nodes were configured, so the rig created and owns the context.
    assert!(rig.owns_context());
    let context = rig.context().expect("context exists").clone();

    rig.stop().await;
    assert!(context.is_terminated());
}

#[tokio::test]
#[serial]
async fn test_unreachable_remote_node_does_not_abort_start() {
    let config = parse(
        r#"
        [cluster]
        connection_timeout = "300ms"
        provision_timeout = "300ms"

        [transport]
        connect_timeout = "200ms"

        [devices.stage_a]
        target = "mock_stage"

        [[nodes]]
        name = "far_side"
        hostname = "nowhere.invalid"
        devices = ["camera_1"]
        endpoints = { request = "127.0.0.1:9", publish = "127.0.0.1:9" }
        "#,
    );

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("start completes");

    assert!(rig.handles().contains_key("stage_a"));
    assert!(!rig.handles().contains_key("camera_1"));

    let status = rig.node_status();
    assert_eq!(status["far_side"].state, NodeState::Failed);
    assert!(status["far_side"].message.is_some());

    rig.stop().await;
}

#[tokio::test]
#[serial]
async fn test_injected_context_is_never_torn_down() {
    let config = parse(
        r#"
        [cluster]
        connection_timeout = "300ms"
        provision_timeout = "300ms"

        [transport]
        connect_timeout = "200ms"

        [[nodes]]
        name = "far_side"
        hostname = "nowhere.invalid"
        devices = ["camera_1"]
        endpoints = { request = "127.0.0.1:9", publish = "127.0.0.1:9" }
        "#,
    );

    let context = NetContext::new();
    let mut rig = Rig::new(config, builtin_registry()).with_context(context.clone());
    rig.start().await.expect("start completes");

    assert!(!rig.owns_context());
    rig.stop().await;
    assert!(!context.is_terminated());
}

#[tokio::test]
#[serial]
async fn test_remote_node_roundtrip_through_hosted_service() {
    // Stand in for the remote machine: host stage_b behind a service.
    let mut init = Map::new();
    init.insert("initial_position".to_string(), json!(5.0));
    let device = MockStage::from_init(ResolvedInit::from_values("stage_b", &init))
        .expect("stage builds");
    let mut controllers = HashMap::new();
    controllers.insert("stage_b".to_string(), DeviceController::new(device));
    let service = DeviceService::bind("127.0.0.1:0", "127.0.0.1:0", controllers)
        .await
        .expect("service binds");

    let config = parse(&format!(
        r#"
        [devices.stage_a]
        target = "mock_stage"

        [[nodes]]
        name = "bench"
        hostname = "bench-pc.invalid"
        devices = ["stage_b"]
        endpoints = {{ request = "{request}", publish = "{publish}" }}
        "#,
        request = service.request_addr(),
        publish = service.publish_addr(),
    ));

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("start succeeds");

    assert_eq!(rig.node_status()["bench"].state, NodeState::Connected);

    // The remote device is addressable through its handle, but has no
    // in-process object.
    let handle = rig.handle("stage_b").expect("remote handle exists");
    assert!(handle.device().is_none());
    assert!(rig.get_device("stage_b").is_none());

    assert_eq!(handle.get("position").await.expect("get works"), json!(5.0));
    handle
        .call("move_by", vec![json!(1.5)])
        .await
        .expect("command works");
    assert_eq!(handle.get("position").await.expect("get works"), json!(6.5));

    let interface = handle.interface().await.expect("interface works");
    assert_eq!(interface.uid, "stage_b");

    rig.stop().await;
    service.stop().await;
}

#[tokio::test]
#[serial]
async fn test_rig_start_and_stop_are_idempotent() {
    let config = parse(
        r#"
        [devices.stage_a]
        target = "mock_stage"
        "#,
    );

    let mut rig = Rig::new(config, builtin_registry());
    rig.start().await.expect("first start");
    rig.start().await.expect("second start is a no-op");
    rig.stop().await;
    rig.stop().await;
}

#[tokio::test]
#[serial]
async fn test_post_start_hook_sees_the_started_rig() {
    use async_trait::async_trait;
    use labrig::rig::RigHook;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl RigHook for CountingHook {
        async fn post_start(&self, rig: &Rig) -> anyhow::Result<()> {
            self.0.store(rig.handles().len(), Ordering::SeqCst);
            Ok(())
        }
    }

    let config = parse(
        r#"
        [devices.stage_a]
        target = "mock_stage"
        "#,
    );

    let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
    let mut rig = Rig::new(config, builtin_registry()).with_hook(hook.clone());
    rig.start().await.expect("start succeeds");
    assert_eq!(hook.0.load(std::sync::atomic::Ordering::SeqCst), 1);

    rig.stop().await;

    // Standalone build of a node spec mirrors what `serve` does.
    let spec = builder::BuildGroupSpec::from([(
        "stage_x".to_string(),
        builder::BuildConfig::new("mock_stage"),
    )]);
    let report = builder::build(&spec, &builtin_registry()).await;
    assert_eq!(report.built.len(), 1);
}
