//! Custom error types for the fabric.
//!
//! This module defines the primary error type, `RigError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of errors that can occur, from configuration and
//! I/O issues to transport failures on the wire.
//!
//! ## Error Hierarchy
//!
//! `RigError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such
//!   as values that parse but are logically incorrect (e.g., a node claiming a
//!   device uid that has no build config). These are caught during validation.
//! - **`Io`**: Wraps standard `std::io::Error`, covering all socket I/O issues.
//! - **`Transport`** / **`Timeout`**: Failures on the request or subscribe
//!   sockets. A hung peer surfaces as `Timeout` rather than blocking forever;
//!   refused or reset connections surface as `Transport`.
//! - **`Protocol`**: A frame or body arrived that does not match the wire
//!   contract (bad kind tag, oversized frame, malformed JSON).
//! - **`Parameter`**: A command or property write was rejected by capability
//!   validation before any device code ran.
//! - **`Call`**: The device side executed the request and reported a failure;
//!   the message is the device's own error text, identical whether the device
//!   is local or remote.
//!
//! Build failures are deliberately *not* represented here: the object graph
//! builder accumulates [`crate::builder::BuildError`] values and returns them
//! as data, it never raises for a per-device failure.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Central error type for rig, cluster, adapter and transport operations.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("Device call failed: {0}")]
    Call(String),

    #[error("Adapter for '{0}' is closed")]
    Closed(String),

    #[error("Distributed nodes are configured but no network context is available")]
    NoContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_duration() {
        let err = RigError::Timeout(std::time::Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn io_errors_convert_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RigError = io.into();
        assert!(matches!(err, RigError::Io(_)));
    }
}
