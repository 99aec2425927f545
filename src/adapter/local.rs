//! In-process adapter for a co-located controller.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::adapter::{
    dispatch_publication, Adapter, CallbackSet, PropsCallback, StreamCallback,
};
use crate::capability::{Device, DeviceInterface};
use crate::controller::DeviceController;
use crate::error::{RigError, RigResult};
use crate::wire::{stream_topic, CommandResponse, PropsResponse};

/// Adapter calling straight into a co-located [`DeviceController`].
///
/// No serialization, no transport; a pump task bridges the controller's
/// publication channel into the registered callbacks so notification
/// delivery behaves exactly like the remote case.
pub struct LocalAdapter {
    uid: String,
    controller: Arc<DeviceController>,
    callbacks: Arc<RwLock<CallbackSet>>,
    shutdown_tx: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LocalAdapter {
    /// Wrap a controller and start the notification pump.
    pub fn new(controller: Arc<DeviceController>) -> Arc<Self> {
        let uid = controller.uid().to_string();
        let callbacks = Arc::new(RwLock::new(CallbackSet::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(pump_publications(
            uid.clone(),
            controller.subscribe(),
            callbacks.clone(),
            shutdown_rx,
        ));

        Arc::new(Self {
            uid,
            controller,
            callbacks,
            shutdown_tx,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> RigResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RigError::Closed(self.uid.clone()));
        }
        Ok(())
    }
}

async fn pump_publications(
    uid: String,
    mut rx: broadcast::Receiver<crate::capability::Publication>,
    callbacks: Arc<RwLock<CallbackSet>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = rx.recv() => match received {
                Ok(publication) => {
                    let set = callbacks.read().await;
                    dispatch_publication(&uid, &set, &publication.topic, &publication.payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(uid = %uid, skipped, "notification pump lagged, publications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn device(&self) -> Option<Arc<dyn Device>> {
        Some(self.controller.device())
    }

    async fn run_command(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> RigResult<Value> {
        self.ensure_open()?;
        match self.controller.run_command(name, &args, &kwargs).await {
            CommandResponse::Success { value } => Ok(value),
            CommandResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn get_props(&self, names: &[String]) -> RigResult<Map<String, Value>> {
        self.ensure_open()?;
        match self.controller.get_props(names).await {
            PropsResponse::Success { props } => Ok(props),
            PropsResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn set_props(&self, props: Map<String, Value>) -> RigResult<()> {
        self.ensure_open()?;
        match self.controller.set_props(&props).await {
            PropsResponse::Success { .. } => Ok(()),
            PropsResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn interface(&self) -> RigResult<DeviceInterface> {
        self.ensure_open()?;
        Ok(self.controller.interface())
    }

    async fn on_props_changed(&self, callback: PropsCallback) {
        self.callbacks.write().await.add_props(callback);
    }

    async fn subscribe(&self, stream: &str, callback: StreamCallback) {
        let topic = stream_topic(&self.uid, stream);
        self.callbacks.write().await.add_stream(topic, callback);
    }

    async fn unsubscribe(&self, stream: &str) {
        let topic = stream_topic(&self.uid, stream);
        self.callbacks.write().await.remove_stream(&topic);
    }

    async fn close(&self) -> RigResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Stop the pump and wait for it to fully finish so no callback can
        // run after close() returns.
        let _ = self.shutdown_tx.send(true);
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = pump.await;
        }
        Ok(())
    }
}
