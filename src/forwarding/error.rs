//! Error types for forwarding operations.
//!
//! This module defines errors for:
//! - Forwarding engine primitives (bind, resolve, lifecycle)
//! - The forwarding state store (closed store, failed rule operations)

use std::net::SocketAddr;
use thiserror::Error;

use super::entry::{ForwardEntry, Protocol};

/// Errors reported by a forwarding engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has not been started, or has been stopped.
    #[error("Forwarding engine is not running")]
    NotRunning,

    /// The engine was started outside of a tokio runtime.
    #[error("Forwarding engine needs a tokio runtime: {0}")]
    NoRuntime(String),

    /// The remote address could not be resolved to a socket address.
    #[error("Failed to resolve remote address {address}")]
    NameResolution {
        /// The address as given.
        address: String,
    },

    /// Failed to bind the local side of a rule.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The local address we tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The engine already forwards this local port.
    #[error("Local port {0} is already forwarded")]
    PortInUse(u16),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the forwarding state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("Forwarder is closed")]
    Closed,

    /// An engine failed outside of a rule operation (e.g. on start).
    #[error("{protocol} engine error: {source}")]
    Engine {
        /// Which engine failed.
        protocol: Protocol,
        /// The underlying engine error.
        #[source]
        source: EngineError,
    },

    /// The engine rejected a new rule.
    #[error("Failed to forward {protocol} port {entry}: {source}")]
    AddFailed {
        /// Protocol of the rule.
        protocol: Protocol,
        /// The rule that failed.
        entry: ForwardEntry,
        /// The underlying engine error.
        #[source]
        source: EngineError,
    },

    /// The engine failed to drop a rule.
    #[error("Failed to stop forwarding {protocol} port {entry}: {source}")]
    RemoveFailed {
        /// Protocol of the rule.
        protocol: Protocol,
        /// The rule that failed.
        entry: ForwardEntry,
        /// The underlying engine error.
        #[source]
        source: EngineError,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
