//! Device service: the serving counterpart of the network adapter.
//!
//! Binds one request/reply endpoint and one publish endpoint for a group of
//! controllers. Every control connection gets a strict alternating
//! request/reply loop; every subscriber connection receives the merged
//! publication stream of all hosted controllers as `[topic, payload]`
//! frames, best-effort.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::Publication;
use crate::controller::DeviceController;
use crate::error::{RigError, RigResult};
use crate::wire::{self, AttributeRequest, CommandResponse, PropsResponse, RequestKind};

/// Per-subscriber outbound queue depth; a subscriber that cannot keep up
/// loses publications rather than stalling the fan-out.
const SUBSCRIBER_BUFFER: usize = 256;

type SubscriberList = Arc<Mutex<Vec<mpsc::Sender<Publication>>>>;

/// Hosts a group of controllers behind paired request/reply and publish
/// endpoints.
pub struct DeviceService {
    controllers: Arc<HashMap<String, Arc<DeviceController>>>,
    request_addr: SocketAddr,
    publish_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DeviceService {
    /// Bind both endpoints and start serving.
    pub async fn bind(
        request_addr: &str,
        publish_addr: &str,
        controllers: HashMap<String, Arc<DeviceController>>,
    ) -> RigResult<Self> {
        let request_listener = TcpListener::bind(request_addr)
            .await
            .map_err(|e| RigError::Transport(format!("bind {request_addr} failed: {e}")))?;
        let publish_listener = TcpListener::bind(publish_addr)
            .await
            .map_err(|e| RigError::Transport(format!("bind {publish_addr} failed: {e}")))?;

        let request_addr = request_listener.local_addr()?;
        let publish_addr = publish_listener.local_addr()?;
        info!(%request_addr, %publish_addr, devices = controllers.len(), "device service listening");

        let controllers = Arc::new(controllers);
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, _) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_requests(
            request_listener,
            controllers.clone(),
            shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(accept_subscribers(
            publish_listener,
            subscribers.clone(),
            shutdown_tx.subscribe(),
        )));
        for controller in controllers.values() {
            tasks.push(tokio::spawn(pump_controller(
                controller.uid().to_string(),
                controller.subscribe(),
                subscribers.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        Ok(Self {
            controllers,
            request_addr,
            publish_addr,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    /// The bound request/reply address.
    pub fn request_addr(&self) -> SocketAddr {
        self.request_addr
    }

    /// The bound publish address.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    /// Uids of the hosted devices.
    pub fn device_uids(&self) -> Vec<String> {
        self.controllers.keys().cloned().collect()
    }

    /// Stop serving: signal every task, then await them in reverse start
    /// order before returning.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..).rev() {
            let _ = task.await;
        }
        debug!(request_addr = %self.request_addr, "device service stopped");
    }
}

async fn accept_requests(
    listener: TcpListener,
    controllers: Arc<HashMap<String, Arc<DeviceController>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let controllers = controllers.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        handle_control_connection(stream, peer, controllers, shutdown_rx).await;
                    });
                }
                Err(err) => error!(error = %err, "accept error on request endpoint"),
            }
        }
    }
}

async fn handle_control_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    controllers: Arc<HashMap<String, Arc<DeviceController>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let conn_id = Uuid::new_v4();
    debug!(%peer, %conn_id, "control connection opened");
    if let Err(err) = crate::net::harden_stream(&stream, &crate::net::SocketTuning::default()) {
        warn!(%peer, error = %err, "socket hardening failed");
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = wire::read_request(&mut stream) => {
                let (kind, payload) = match read {
                    Ok(frames) => frames,
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => {
                        warn!(%peer, %conn_id, error = %err, "malformed request, closing connection");
                        break;
                    }
                };

                let reply = dispatch(&controllers, kind, &payload).await;
                if let Err(err) = wire::write_reply(&mut stream, &reply).await {
                    warn!(%peer, %conn_id, error = %err, "failed to write reply");
                    break;
                }
            }
        }
    }
    debug!(%peer, %conn_id, "control connection closed");
}

/// Dispatch one call to the controller named in the request body, producing
/// exactly one reply in the kind-appropriate shape.
async fn dispatch(
    controllers: &HashMap<String, Arc<DeviceController>>,
    kind: RequestKind,
    payload: &[u8],
) -> Vec<u8> {
    let request: AttributeRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(err) => return error_reply(kind, format!("malformed request body: {err}")),
    };

    let Some(controller) = controllers.get(&request.device) else {
        return error_reply(kind, format!("unknown device '{}'", request.device));
    };

    match kind {
        RequestKind::RunCommand => {
            let response = controller
                .run_command(&request.attribute, &request.args, &request.kwargs)
                .await;
            serde_json::to_vec(&response).unwrap_or_default()
        }
        RequestKind::GetProperties => {
            let names: Vec<String> = request
                .args
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let response = controller.get_props(&names).await;
            serde_json::to_vec(&response).unwrap_or_default()
        }
        RequestKind::SetProperties => {
            let response = controller.set_props(&request.kwargs).await;
            serde_json::to_vec(&response).unwrap_or_default()
        }
        RequestKind::GetInterface => {
            serde_json::to_vec(&controller.interface()).unwrap_or_default()
        }
    }
}

fn error_reply(kind: RequestKind, message: String) -> Vec<u8> {
    match kind {
        RequestKind::GetProperties | RequestKind::SetProperties => {
            serde_json::to_vec(&PropsResponse::Error { message }).unwrap_or_default()
        }
        RequestKind::RunCommand | RequestKind::GetInterface => {
            serde_json::to_vec(&CommandResponse::Error { message }).unwrap_or_default()
        }
    }
}

async fn accept_subscribers(
    listener: TcpListener,
    subscribers: SubscriberList,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "subscriber connected");
                    if let Err(err) =
                        crate::net::harden_stream(&stream, &crate::net::SocketTuning::default())
                    {
                        warn!(%peer, error = %err, "socket hardening failed");
                    }
                    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                    subscribers.lock().await.push(tx);
                    tokio::spawn(write_subscriber(stream, peer, rx, shutdown_rx.clone()));
                }
                Err(err) => error!(error = %err, "accept error on publish endpoint"),
            }
        }
    }
}

async fn write_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Publication>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            publication = rx.recv() => match publication {
                Some(publication) => {
                    if let Err(err) =
                        wire::write_publication(&mut stream, &publication.topic, &publication.payload).await
                    {
                        debug!(%peer, error = %err, "subscriber write failed, dropping");
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Forward one controller's publications to every connected subscriber.
async fn pump_controller(
    uid: String,
    mut rx: tokio::sync::broadcast::Receiver<Publication>,
    subscribers: SubscriberList,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = rx.recv() => match received {
                Ok(publication) => {
                    let mut list = subscribers.lock().await;
                    list.retain(|tx| match tx.try_send(publication.clone()) {
                        Ok(()) => true,
                        // Full queue: drop this publication for the slow
                        // subscriber, keep the subscriber.
                        Err(mpsc::error::TrySendError::Full(_)) => true,
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(uid = %uid, skipped, "publication pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ResolvedInit;
    use crate::devices::MockStage;
    use serde_json::Map;

    async fn bound_service() -> DeviceService {
        let init = Map::new();
        let device = MockStage::from_init(ResolvedInit::from_values("stage_1", &init))
            .expect("mock stage builds");
        let mut controllers = HashMap::new();
        controllers.insert("stage_1".to_string(), DeviceController::new(device));
        DeviceService::bind("127.0.0.1:0", "127.0.0.1:0", controllers)
            .await
            .expect("service binds")
    }

    #[tokio::test]
    async fn test_bind_reports_local_addrs() {
        let service = bound_service().await;
        assert_ne!(service.request_addr().port(), 0);
        assert_ne!(service.publish_addr().port(), 0);
        assert_eq!(service.device_uids(), vec!["stage_1".to_string()]);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let service = bound_service().await;
        service.stop().await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_device_error_reply_shape() {
        let controllers = HashMap::new();
        let reply = dispatch(&controllers, RequestKind::GetProperties, b"{\"device\":\"ghost\",\"attribute\":\"properties\"}").await;
        let decoded: PropsResponse = serde_json::from_slice(&reply).unwrap();
        match decoded {
            PropsResponse::Error { message } => assert!(message.contains("ghost")),
            PropsResponse::Success { .. } => panic!("expected error reply"),
        }
    }
}
