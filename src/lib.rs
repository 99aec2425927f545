//! # labrig
//!
//! A distributed instrument-control fabric for laboratory rigs. The crate
//! lets a control application address a heterogeneous set of devices —
//! cameras, lasers, stages, DAQ cards — through one uniform capability
//! interface, regardless of whether each device lives in the local process
//! or on a remote machine.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`builder`**: Instantiates typed device graphs from declarative build
//!   configs, resolving inter-device references and isolating per-device
//!   failures.
//! - **`capability`**: The contract a device implementation exposes —
//!   introspectable properties with optional numeric constraints, and
//!   commands with validated parameter schemas.
//! - **`registry`**: Explicit mapping from declarative type identifiers to
//!   device factory functions, populated once at process start.
//! - **`controller`**: Server-side wrapper executing commands and property
//!   access against one concrete device and publishing change batches.
//! - **`adapter`**: Uniform client-side access objects — an in-process
//!   call-through for co-located devices and a request/reply + subscribe
//!   client for remote ones.
//! - **`handle`**: The thin capability-typed facade application code uses to
//!   call a device, identical in shape local or remote.
//! - **`service`**: Hosts controllers behind paired request/reply and
//!   publish endpoints, the serving counterpart of the network adapter.
//! - **`wire`**: The framed wire protocol and its JSON message bodies.
//! - **`cluster`**: Owns a collection of nodes (named device groups, local
//!   or remote), builds and hosts local ones, connects to remote ones, and
//!   aggregates all resulting handles.
//! - **`rig`**: The composition root — builds local devices, starts the
//!   cluster, merges handle maps and owns the shared lifecycle.
//! - **`net`**: Shared network context, socket tuning and hardening.
//! - **`config`**: Strongly-typed configuration loading and validation.
//! - **`telemetry`**: Tracing subscriber setup.
//! - **`devices`**: Bundled mock devices for tests, demos and hosting.
//! - **`error`**: The central `RigError` type.

pub mod adapter;
pub mod builder;
pub mod capability;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod handle;
pub mod net;
pub mod registry;
pub mod rig;
pub mod service;
pub mod telemetry;
pub mod wire;

pub use error::{RigError, RigResult};
