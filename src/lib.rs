//! portsync: keep host port forwards in sync with running containers
//!
//! Every published TCP and UDP port of every running container is forwarded
//! from the host to the container's address. Forwards are added and removed
//! as containers start and stop.
//!
//! # Architecture
//!
//! - **Forwarding**: Rule model, TCP/UDP engines and the state store that
//!   mirrors what the engines have applied
//! - **Runtime**: Read access to the container runtime (Docker)
//! - **Reconcile**: Desired-state collection, the reconciliation pass and the
//!   heartbeat/event triggers that request passes
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails
//! - **Daemon**: Process lifecycle and shutdown

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod forwarding;
pub mod reconcile;
pub mod runtime;
pub mod telemetry;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod testing;
