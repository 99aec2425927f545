//! Request/reply + subscribe client for a remote device.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::adapter::{
    dispatch_publication, Adapter, CallbackSet, PropsCallback, StreamCallback,
};
use crate::capability::DeviceInterface;
use crate::error::{RigError, RigResult};
use crate::net::{open_stream, NetContext, SocketTuning};
use crate::wire::{
    self, AttributeRequest, CommandResponse, InterfaceReply, PropsResponse, RequestKind,
};

/// Adapter for one device hosted by a remote service.
///
/// Maintains one request socket with strict alternating request/reply
/// semantics — an exclusive lock serializes callers, so a reply always
/// corresponds to the most recently sent request — and one subscribe socket
/// drained by a background receive loop.
pub struct NetworkAdapter {
    uid: String,
    request: Mutex<TcpStream>,
    tuning: SocketTuning,
    callbacks: Arc<RwLock<CallbackSet>>,
    shutdown_tx: watch::Sender<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    terminated: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl NetworkAdapter {
    /// Connect both sockets for a device and start the receive loop.
    pub async fn connect(
        uid: &str,
        request_addr: &str,
        publish_addr: &str,
        context: &NetContext,
    ) -> RigResult<Arc<Self>> {
        let tuning = context.tuning().clone();
        let request = open_stream(request_addr, &tuning).await?;
        let subscribe = open_stream(publish_addr, &tuning).await?;
        debug!(uid, request_addr, publish_addr, "network adapter connected");

        let callbacks = Arc::new(RwLock::new(CallbackSet::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let recv_task = tokio::spawn(recv_loop(
            uid.to_string(),
            subscribe,
            callbacks.clone(),
            shutdown_rx,
            context.terminated(),
        ));

        Ok(Arc::new(Self {
            uid: uid.to_string(),
            request: Mutex::new(request),
            tuning,
            callbacks,
            shutdown_tx,
            recv_task: Mutex::new(Some(recv_task)),
            terminated: context.terminated(),
            closed: AtomicBool::new(false),
        }))
    }

    fn ensure_open(&self) -> RigResult<()> {
        if self.closed.load(Ordering::SeqCst) || *self.terminated.borrow() {
            return Err(RigError::Closed(self.uid.clone()));
        }
        Ok(())
    }

    /// Send one call and await exactly one reply.
    ///
    /// The request socket cannot tolerate interleaved requests, so the lock
    /// is held from send to reply. A hung peer surfaces as `Timeout`.
    async fn request(&self, kind: RequestKind, request: &AttributeRequest) -> RigResult<Vec<u8>> {
        self.ensure_open()?;
        let payload = serde_json::to_vec(request)?;

        let mut stream = self.request.lock().await;
        timeout(
            self.tuning.send_timeout,
            wire::write_request(&mut *stream, kind, &payload),
        )
        .await
        .map_err(|_| RigError::Timeout(self.tuning.send_timeout))??;

        let reply = timeout(self.tuning.recv_timeout, wire::read_reply(&mut *stream))
            .await
            .map_err(|_| RigError::Timeout(self.tuning.recv_timeout))??;

        Ok(reply)
    }

    fn attribute_request(&self, attribute: &str) -> AttributeRequest {
        AttributeRequest {
            device: self.uid.clone(),
            attribute: attribute.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }
}

async fn recv_loop(
    uid: String,
    mut subscribe: TcpStream,
    callbacks: Arc<RwLock<CallbackSet>>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut terminated: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = terminated.changed() => {
                debug!(uid = %uid, "network context terminated, stopping receive loop");
                break;
            }
            received = wire::read_publication(&mut subscribe) => match received {
                Ok((topic, payload)) => {
                    let set = callbacks.read().await;
                    dispatch_publication(&uid, &set, &topic, &payload);
                }
                Err(err) => {
                    warn!(uid = %uid, error = %err, "subscribe stream closed");
                    break;
                }
            }
        }
    }
    // The subscribe socket is dropped here, strictly after the loop stopped.
}

#[async_trait]
impl Adapter for NetworkAdapter {
    fn uid(&self) -> &str {
        &self.uid
    }

    async fn run_command(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> RigResult<Value> {
        let mut request = self.attribute_request(name);
        request.args = args;
        request.kwargs = kwargs;

        let reply = self.request(RequestKind::RunCommand, &request).await?;
        match serde_json::from_slice::<CommandResponse>(&reply)? {
            CommandResponse::Success { value } => Ok(value),
            CommandResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn get_props(&self, names: &[String]) -> RigResult<Map<String, Value>> {
        let mut request = self.attribute_request("properties");
        request.args = names.iter().map(|n| Value::String(n.clone())).collect();

        let reply = self.request(RequestKind::GetProperties, &request).await?;
        match serde_json::from_slice::<PropsResponse>(&reply)? {
            PropsResponse::Success { props } => Ok(props),
            PropsResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn set_props(&self, props: Map<String, Value>) -> RigResult<()> {
        let mut request = self.attribute_request("properties");
        request.kwargs = props;

        let reply = self.request(RequestKind::SetProperties, &request).await?;
        match serde_json::from_slice::<PropsResponse>(&reply)? {
            PropsResponse::Success { .. } => Ok(()),
            PropsResponse::Error { message } => Err(RigError::Call(message)),
        }
    }

    async fn interface(&self) -> RigResult<DeviceInterface> {
        let request = self.attribute_request("interface");
        let reply = self.request(RequestKind::GetInterface, &request).await?;
        match serde_json::from_slice::<InterfaceReply>(&reply)? {
            InterfaceReply::Interface(interface) => Ok(interface),
            InterfaceReply::Error(CommandResponse::Error { message }) => {
                Err(RigError::Call(message))
            }
            InterfaceReply::Error(CommandResponse::Success { .. }) => Err(RigError::Protocol(
                "interface reply carried a command response".to_string(),
            )),
        }
    }

    async fn on_props_changed(&self, callback: PropsCallback) {
        self.callbacks.write().await.add_props(callback);
    }

    async fn subscribe(&self, stream: &str, callback: StreamCallback) {
        let topic = wire::stream_topic(&self.uid, stream);
        self.callbacks.write().await.add_stream(topic, callback);
    }

    async fn unsubscribe(&self, stream: &str) {
        let topic = wire::stream_topic(&self.uid, stream);
        self.callbacks.write().await.remove_stream(&topic);
    }

    async fn close(&self) -> RigResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Cancel the receive loop and wait for it to fully stop before
        // touching either socket, so the loop can never read from a closed
        // socket.
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.recv_task.lock().await.take() {
            let _ = task.await;
        }

        let mut stream = self.request.lock().await;
        if let Err(err) = stream.shutdown().await {
            debug!(uid = %self.uid, error = %err, "request socket shutdown");
        }
        Ok(())
    }
}
