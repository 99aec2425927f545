//! labrig binary: run a full rig or host one node's device service.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use labrig::builder;
use labrig::config::RigConfig;
use labrig::controller::DeviceController;
use labrig::devices;
use labrig::rig::Rig;
use labrig::service::DeviceService;
use labrig::telemetry::{self, TelemetryConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "labrig", about = "Distributed instrument-control fabric")]
struct Cli {
    /// Path to the rig configuration file.
    #[arg(short, long, default_value = "config/rig.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the full rig (local devices plus cluster) until Ctrl-C.
    Run,
    /// Host a single node's device service, for running on a remote machine.
    Serve {
        /// Name of the node to host, as declared in the configuration.
        #[arg(long)]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    telemetry::init(&TelemetryConfig::from_config(&config)?)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Serve { node } => serve(config, &node).await,
    }
}

async fn run(config: RigConfig) -> Result<()> {
    let mut rig = Rig::new(config, devices::builtin_registry());
    rig.start().await?;

    for (uid, err) in rig.build_errors() {
        warn!(uid = %uid, kind = ?err.kind, message = %err.message, "device unavailable");
    }
    for (name, status) in rig.node_status() {
        info!(node = %name, state = ?status.state, "node status");
    }
    info!(devices = rig.handles().len(), "rig ready, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    rig.stop().await;
    Ok(())
}

async fn serve(config: RigConfig, node_name: &str) -> Result<()> {
    let node = config
        .node(node_name)
        .ok_or_else(|| anyhow!("node '{node_name}' is not declared in the configuration"))?
        .clone();

    let spec = config.spec();
    let mut node_spec = HashMap::new();
    for uid in &node.devices {
        let build = spec
            .get(uid)
            .ok_or_else(|| anyhow!("device '{uid}' has no build config"))?;
        node_spec.insert(uid.clone(), build.clone());
    }

    let registry = devices::builtin_registry();
    let report = builder::build(&node_spec, &registry).await;
    for (uid, err) in &report.errors {
        warn!(uid = %uid, kind = ?err.kind, message = %err.message, "device build failed");
    }

    let mut controllers = HashMap::new();
    for (uid, device) in report.built {
        controllers.insert(uid, DeviceController::new(device));
    }
    if controllers.is_empty() {
        return Err(anyhow!("node '{node_name}' has no buildable devices"));
    }

    let service = DeviceService::bind(&node.endpoints.request, &node.endpoints.publish, controllers)
        .await
        .context("binding node endpoints")?;
    info!(
        node = %node_name,
        request = %service.request_addr(),
        publish = %service.publish_addr(),
        "serving, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    service.stop().await;
    Ok(())
}
