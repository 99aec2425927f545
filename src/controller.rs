//! Device controller.
//!
//! Wraps exactly one device instance on the serving side: validates and
//! executes commands, batches property reads and writes, renders the
//! interface snapshot, and publishes change notifications. The controller is
//! transport-agnostic — publications go into a broadcast channel that local
//! adapters and hosted services drain; it never touches a socket.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

use crate::capability::{Device, DeviceInterface, Publication, PublishSink};
use crate::wire::{self, CommandResponse, PropsResponse};

/// Buffered publications per controller before slow subscribers start
/// lagging. Delivery is best-effort; a lagging subscriber skips ahead.
const PUBLICATION_BUFFER: usize = 64;

/// Server-side wrapper executing commands and property access against one
/// concrete device.
pub struct DeviceController {
    device: Arc<dyn Device>,
    publish_tx: broadcast::Sender<Publication>,
}

impl DeviceController {
    /// Wrap a device and hand it the publish sink.
    pub fn new(device: Arc<dyn Device>) -> Arc<Self> {
        let (publish_tx, _) = broadcast::channel(PUBLICATION_BUFFER);
        device.attach_publisher(PublishSink::new(device.uid().to_string(), publish_tx.clone()));
        Arc::new(Self { device, publish_tx })
    }

    /// The wrapped device's uid.
    pub fn uid(&self) -> &str {
        self.device.uid()
    }

    /// The wrapped device.
    pub fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    /// Subscribe to this controller's publication stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.publish_tx.subscribe()
    }

    /// The serializable capability snapshot.
    pub fn interface(&self) -> DeviceInterface {
        self.device.descriptor().interface(self.device.uid())
    }

    /// Validate and execute a command, wrapping the result or the failure.
    ///
    /// Invalid parameters fail closed — the device is never invoked.
    pub async fn run_command(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> CommandResponse {
        if let Err(err) = self
            .device
            .descriptor()
            .validate_command(name, args, kwargs)
        {
            return CommandResponse::Error {
                message: err.to_string(),
            };
        }

        match self.device.run_command(name, args, kwargs).await {
            Ok(value) => CommandResponse::Success { value },
            Err(err) => CommandResponse::Error {
                message: format!("{err:#}"),
            },
        }
    }

    /// Read a batch of properties; an empty name list reads all of them.
    pub async fn get_props(&self, names: &[String]) -> PropsResponse {
        let descriptor = self.device.descriptor();
        let names: Vec<String> = if names.is_empty() {
            descriptor
                .properties()
                .iter()
                .map(|p| p.name.clone())
                .collect()
        } else {
            names.to_vec()
        };

        let mut props = Map::new();
        for name in names {
            if descriptor.property_spec(&name).is_none() {
                return PropsResponse::Error {
                    message: format!("unknown property '{name}'"),
                };
            }
            match self.device.read_prop(&name).await {
                Ok(value) => {
                    props.insert(name, value);
                }
                Err(err) => {
                    return PropsResponse::Error {
                        message: format!("read of '{name}' failed: {err:#}"),
                    };
                }
            }
        }

        PropsResponse::Success { props }
    }

    /// Write a batch of properties and publish the applied changes.
    ///
    /// The whole batch is validated before any write happens. Writes are then
    /// applied in order; on a write failure the successfully applied subset
    /// is still published, and the reply names the failed property.
    pub async fn set_props(&self, props: &Map<String, Value>) -> PropsResponse {
        let descriptor = self.device.descriptor();
        for (name, value) in props {
            if let Err(err) = descriptor.validate_write(name, value) {
                return PropsResponse::Error {
                    message: err.to_string(),
                };
            }
        }

        let mut applied = Map::new();
        for (name, value) in props {
            match self.device.write_prop(name, value.clone()).await {
                Ok(()) => {
                    applied.insert(name.clone(), value.clone());
                }
                Err(err) => {
                    if !applied.is_empty() {
                        self.publish_props(applied);
                    }
                    return PropsResponse::Error {
                        message: format!("write to '{name}' failed: {err:#}"),
                    };
                }
            }
        }

        self.publish_props(applied.clone());
        PropsResponse::Success { props: applied }
    }

    /// Emit opaque bytes on `{uid}/{stream}` for drivers that produce
    /// byte-streams outside the device itself.
    pub fn publish_stream(&self, stream: &str, payload: Vec<u8>) {
        let _ = self.publish_tx.send(Publication {
            topic: wire::stream_topic(self.device.uid(), stream),
            payload,
        });
    }

    fn publish_props(&self, props: Map<String, Value>) {
        if props.is_empty() {
            return;
        }
        let body = PropsResponse::Success { props };
        match serde_json::to_vec(&body) {
            Ok(payload) => {
                let _ = self.publish_tx.send(Publication {
                    topic: wire::properties_topic(self.device.uid()),
                    payload,
                });
            }
            Err(err) => error!(uid = self.device.uid(), error = %err, "failed to encode props batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ResolvedInit;
    use crate::devices::MockStage;
    use serde_json::json;

    fn stage_controller() -> Arc<DeviceController> {
        let init = Map::new();
        let device = MockStage::from_init(ResolvedInit::from_values("stage_1", &init))
            .expect("mock stage builds");
        DeviceController::new(device)
    }

    #[tokio::test]
    async fn test_get_all_props() {
        let controller = stage_controller();
        match controller.get_props(&[]).await {
            PropsResponse::Success { props } => {
                assert!(props.contains_key("position"));
                assert!(props.contains_key("velocity"));
            }
            PropsResponse::Error { message } => panic!("unexpected error: {message}"),
        }
    }

    #[tokio::test]
    async fn test_set_props_publishes_batch() {
        let controller = stage_controller();
        let mut rx = controller.subscribe();

        let mut props = Map::new();
        props.insert("position".to_string(), json!(12.0));
        let response = controller.set_props(&props).await;
        assert!(matches!(response, PropsResponse::Success { .. }));

        let publication = rx.recv().await.expect("publication arrives");
        assert_eq!(publication.topic, "stage_1/properties");
        let body: PropsResponse = serde_json::from_slice(&publication.payload).unwrap();
        match body {
            PropsResponse::Success { props } => assert_eq!(props.get("position"), Some(&json!(12.0))),
            PropsResponse::Error { message } => panic!("unexpected error: {message}"),
        }
    }

    #[tokio::test]
    async fn test_set_props_fails_closed_on_invalid_batch() {
        let controller = stage_controller();
        let mut rx = controller.subscribe();

        let mut props = Map::new();
        props.insert("position".to_string(), json!(5.0));
        props.insert("missing".to_string(), json!(1.0));
        let response = controller.set_props(&props).await;
        assert!(matches!(response, PropsResponse::Error { .. }));

        // Nothing was applied, so nothing was published.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_run_unknown_command_rejected() {
        let controller = stage_controller();
        let response = controller
            .run_command("self_destruct", &[], &Map::new())
            .await;
        match response {
            CommandResponse::Error { message } => assert!(message.contains("unknown command")),
            CommandResponse::Success { .. } => panic!("command should have been rejected"),
        }
    }

    #[tokio::test]
    async fn test_interface_names_the_device() {
        let controller = stage_controller();
        assert_eq!(controller.interface().uid, "stage_1");
    }
}
