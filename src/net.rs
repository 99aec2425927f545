//! Shared network context and socket hardening.
//!
//! Every adapter and service in a process can share one [`NetContext`]: it
//! carries the socket tuning knobs and a process-wide termination signal.
//! Ownership of the context — who is responsible for terminating it — is
//! tracked explicitly by the owner as a boolean, never inferred.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{RigError, RigResult};

/// Socket configuration for connection reliability.
///
/// These settings are tuned for a control fabric that maintains persistent
/// connections to devices on the local network, with emphasis on fast
/// failure detection: keep-alive probing notices a dead peer well before any
/// OS-level default would, and explicit request timeouts turn a hung peer
/// into a catchable error instead of an indefinite block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketTuning {
    /// How long to wait for an initial connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Timeout for sending one request.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub send_timeout: Duration,
    /// Timeout for receiving one reply.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub recv_timeout: Duration,
    /// Idle time before the first keep-alive probe.
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive_idle: Duration,
    /// Interval between keep-alive probes.
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive_interval: Duration,
    /// Probes sent before declaring the peer dead.
    #[serde(default = "default_keepalive_retries")]
    pub keepalive_retries: u32,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_keepalive() -> Duration {
    Duration::from_secs(2)
}

fn default_keepalive_retries() -> u32 {
    3
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            send_timeout: default_request_timeout(),
            recv_timeout: default_request_timeout(),
            keepalive_idle: default_keepalive(),
            keepalive_interval: default_keepalive(),
            keepalive_retries: default_keepalive_retries(),
        }
    }
}

/// Shared context for every socket a process opens.
#[derive(Debug)]
pub struct NetContext {
    tuning: SocketTuning,
    term_tx: watch::Sender<bool>,
}

impl NetContext {
    /// Create a context with default tuning.
    pub fn new() -> Arc<Self> {
        Self::with_tuning(SocketTuning::default())
    }

    /// Create a context with explicit tuning.
    pub fn with_tuning(tuning: SocketTuning) -> Arc<Self> {
        let (term_tx, _) = watch::channel(false);
        Arc::new(Self { tuning, term_tx })
    }

    /// The socket tuning this context applies.
    pub fn tuning(&self) -> &SocketTuning {
        &self.tuning
    }

    /// A receiver that fires when the context is terminated; receive loops
    /// select on this alongside their own shutdown signal.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.term_tx.subscribe()
    }

    /// Whether the context has been terminated.
    pub fn is_terminated(&self) -> bool {
        *self.term_tx.borrow()
    }

    /// Terminate the context. Only the owner that created the context may
    /// call this; a caller-supplied context is never torn down by the fabric.
    pub fn terminate(&self) {
        let _ = self.term_tx.send(true);
    }
}

/// Open a TCP stream with keep-alive probing and Nagle disabled.
pub async fn open_stream(addr: &str, tuning: &SocketTuning) -> RigResult<TcpStream> {
    let stream = timeout(tuning.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RigError::Timeout(tuning.connect_timeout))?
        .map_err(|e| RigError::Transport(format!("connect to {addr} failed: {e}")))?;

    harden_stream(&stream, tuning)?;
    Ok(stream)
}

/// Apply keep-alive probing and `TCP_NODELAY` to an already-open stream.
pub fn harden_stream(stream: &TcpStream, tuning: &SocketTuning) -> RigResult<()> {
    stream.set_nodelay(true)?;

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(tuning.keepalive_idle)
        .with_interval(tuning.keepalive_interval)
        .with_retries(tuning.keepalive_retries);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_termination_signal() {
        let context = NetContext::new();
        let mut rx = context.terminated();

        assert!(!context.is_terminated());
        context.terminate();
        assert!(context.is_terminated());
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_transport_error() {
        let tuning = SocketTuning {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let result = open_stream("127.0.0.1:1", &tuning).await;
        assert!(matches!(
            result,
            Err(RigError::Transport(_)) | Err(RigError::Timeout(_))
        ));
    }
}
