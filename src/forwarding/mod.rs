//! Host port forwarding.
//!
//! This module provides:
//! - The rule model ([`ForwardEntry`], [`RuleSet`]) and set diffing
//! - The [`ForwardingEngine`] seam with TCP and UDP implementations
//! - The [`Forwarder`] state store that mirrors what the engines have applied

mod engine;
mod entry;
mod error;
mod slot;
mod store;
mod tcp;
mod udp;

pub use engine::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_UDP_SESSION_TIMEOUT, EngineOptions, ForwardingEngine,
};
pub use entry::{EntriesDiff, ForwardEntry, Protocol, RuleSet, entries_diff};
pub use error::{EngineError, EngineResult, StoreError, StoreResult};
pub use store::{ApplySummary, BoxedEngine, Forwarder};
pub use tcp::TcpEngine;
pub use udp::UdpEngine;
