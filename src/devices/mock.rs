//! Mock devices (always available).
//!
//! `MockStage` is an instantly-settling motion axis; `MockSensor` is a
//! scalar readout with optional coupling to another device and a
//! continuous `frames` byte-stream. Both are driven entirely by their
//! declarative init maps, so they double as the reference implementations
//! for the build and capability contracts.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::builder::ResolvedInit;
use crate::capability::{
    CommandSpec, Device, DeviceDescriptor, ParamKind, ParamSpec, PropertySpec, PublishSink,
};

// =============================================================================
// MockStage
// =============================================================================

/// Single-axis mock stage. Moves settle instantly.
pub struct MockStage {
    uid: String,
    descriptor: DeviceDescriptor,
    position: Mutex<f64>,
    velocity: Mutex<f64>,
}

impl MockStage {
    /// Factory for the `mock_stage` registry target.
    pub fn from_init(init: ResolvedInit) -> Result<Arc<dyn Device>> {
        let descriptor = DeviceDescriptor::new()
            .property(
                PropertySpec::new("position")
                    .label("Position")
                    .units("mm")
                    .range(-100.0, 100.0)
                    .step(0.01),
            )
            .property(
                PropertySpec::new("velocity")
                    .label("Velocity")
                    .units("mm/s")
                    .range(0.0, 10.0),
            )
            .command(CommandSpec::new("home").description("Return to the zero position"))
            .command(
                CommandSpec::new("move_by")
                    .description("Move relative to the current position")
                    .param(ParamSpec::new("distance", ParamKind::Number)),
            );

        Ok(Arc::new(Self {
            uid: init.uid().to_string(),
            descriptor,
            position: Mutex::new(init.f64("initial_position").unwrap_or(0.0)),
            velocity: Mutex::new(init.f64("velocity").unwrap_or(1.0)),
        }))
    }

    /// Current position, for tests and local introspection.
    pub async fn position(&self) -> f64 {
        *self.position.lock().await
    }
}

#[async_trait]
impl Device for MockStage {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn read_prop(&self, name: &str) -> Result<Value> {
        match name {
            "position" => Ok(Value::from(*self.position.lock().await)),
            "velocity" => Ok(Value::from(*self.velocity.lock().await)),
            other => bail!("unsupported property '{other}'"),
        }
    }

    async fn write_prop(&self, name: &str, value: Value) -> Result<()> {
        let number = value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("property '{name}' expects a number"))?;
        match name {
            "position" => *self.position.lock().await = number,
            "velocity" => *self.velocity.lock().await = number,
            other => bail!("unsupported property '{other}'"),
        }
        Ok(())
    }

    async fn run_command(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "home" => {
                *self.position.lock().await = 0.0;
                Ok(Value::Null)
            }
            "move_by" => {
                let bound = self
                    .descriptor
                    .command_spec("move_by")
                    .map(|spec| spec.bind(args, kwargs))
                    .unwrap_or_default();
                let distance = bound
                    .get("distance")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| anyhow::anyhow!("missing distance"))?;
                let mut position = self.position.lock().await;
                *position += distance;
                Ok(Value::from(*position))
            }
            other => bail!("unsupported command '{other}'"),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// MockSensor
// =============================================================================

/// Scalar mock sensor with an optional upstream device dependency.
///
/// The reading is `base + coupling * source.position + noise`. When
/// streaming, readings are published on the `frames` byte-stream as
/// little-endian f64 values.
pub struct MockSensor {
    uid: String,
    descriptor: DeviceDescriptor,
    base: f64,
    noise: f64,
    coupling: f64,
    source: Option<Arc<dyn Device>>,
    sample_period_ms: Mutex<f64>,
    publisher: std::sync::Mutex<Option<PublishSink>>,
    stream: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl MockSensor {
    /// Factory for the `mock_sensor` registry target.
    pub fn from_init(init: ResolvedInit) -> Result<Arc<dyn Device>> {
        let descriptor = DeviceDescriptor::new()
            .property(
                PropertySpec::new("value")
                    .label("Reading")
                    .units("V")
                    .read_only()
                    .streamable(),
            )
            .property(
                PropertySpec::new("sample_period_ms")
                    .label("Sample period")
                    .units("ms")
                    .range(1.0, 10_000.0),
            )
            .command(CommandSpec::new("start_stream").description("Begin continuous readout"))
            .command(CommandSpec::new("stop_stream").description("Halt continuous readout"));

        Ok(Arc::new(Self {
            uid: init.uid().to_string(),
            descriptor,
            base: init.f64("base").unwrap_or(1.0),
            noise: init.f64("noise").unwrap_or(0.01),
            coupling: init.f64("coupling").unwrap_or(0.0),
            source: init.opt_device("source"),
            sample_period_ms: Mutex::new(init.f64("sample_period_ms").unwrap_or(50.0)),
            publisher: std::sync::Mutex::new(None),
            stream: Mutex::new(None),
        }))
    }

    /// The upstream device this sensor is coupled to, if any.
    pub fn source(&self) -> Option<Arc<dyn Device>> {
        self.source.clone()
    }

    async fn reading(&self) -> f64 {
        let mut value = self.base + self.noise * (rand::random::<f64>() - 0.5);
        if self.coupling != 0.0 {
            if let Some(source) = &self.source {
                if let Ok(position) = source.read_prop("position").await {
                    value += self.coupling * position.as_f64().unwrap_or(0.0);
                }
            }
        }
        value
    }

    fn sink(&self) -> Option<PublishSink> {
        match self.publisher.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Device for MockSensor {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    async fn read_prop(&self, name: &str) -> Result<Value> {
        match name {
            "value" => Ok(Value::from(self.reading().await)),
            "sample_period_ms" => Ok(Value::from(*self.sample_period_ms.lock().await)),
            other => bail!("unsupported property '{other}'"),
        }
    }

    async fn write_prop(&self, name: &str, value: Value) -> Result<()> {
        match name {
            "sample_period_ms" => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| anyhow::anyhow!("sample_period_ms expects a number"))?;
                *self.sample_period_ms.lock().await = number;
                Ok(())
            }
            other => bail!("unsupported property '{other}'"),
        }
    }

    async fn run_command(
        &self,
        name: &str,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "start_stream" => {
                let mut stream = self.stream.lock().await;
                if stream.is_some() {
                    bail!("already streaming");
                }
                let Some(sink) = self.sink() else {
                    bail!("sensor is not attached to a controller");
                };

                let period = *self.sample_period_ms.lock().await;
                let base = self.base;
                let noise = self.noise;
                let coupling = self.coupling;
                let source = self.source.clone();
                let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

                let task = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(
                        std::time::Duration::from_millis(period.max(1.0) as u64),
                    );
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = ticker.tick() => {
                                let mut value = base + noise * (rand::random::<f64>() - 0.5);
                                if coupling != 0.0 {
                                    if let Some(source) = &source {
                                        if let Ok(position) = source.read_prop("position").await {
                                            value += coupling * position.as_f64().unwrap_or(0.0);
                                        }
                                    }
                                }
                                sink.publish_stream("frames", value.to_le_bytes().to_vec());
                            }
                        }
                    }
                });

                *stream = Some((shutdown_tx, task));
                Ok(Value::Null)
            }
            "stop_stream" => {
                let mut stream = self.stream.lock().await;
                if let Some((shutdown_tx, task)) = stream.take() {
                    let _ = shutdown_tx.send(true);
                    let _ = task.await;
                    debug!(uid = %self.uid, "stream stopped");
                }
                Ok(Value::Null)
            }
            other => bail!("unsupported command '{other}'"),
        }
    }

    fn attach_publisher(&self, publisher: PublishSink) {
        match self.publisher.lock() {
            Ok(mut guard) => *guard = Some(publisher),
            Err(poisoned) => *poisoned.into_inner() = Some(publisher),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
