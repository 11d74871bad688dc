//! Desired-state collection.
//!
//! Turns the running containers into the rule sets the forwarder should hold.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::forwarding::{ForwardEntry, Protocol, RuleSet};
use crate::runtime::{ContainerRuntime, PortProtocol, PublishedPort, RuntimeError, RuntimeResult};

/// Errors that abort collection before anything is applied.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A runtime query failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result type for collection.
pub type CollectorResult<T> = Result<T, CollectorError>;

/// The rules every running container asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// TCP rules.
    pub tcp: RuleSet,
    /// UDP rules.
    pub udp: RuleSet,
}

impl DesiredState {
    /// Rules for one protocol.
    pub fn rules(&self, protocol: Protocol) -> &RuleSet {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    /// Whether no rules are desired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rules for one protocol, at most one per local port.
#[derive(Default)]
struct PortTable {
    by_local_port: BTreeMap<u16, ForwardEntry>,
}

impl PortTable {
    /// Insert `entry`. When the local port is already claimed by a different
    /// destination, the smaller entry wins so the outcome does not depend on
    /// the order the runtime lists containers in.
    fn insert(&mut self, protocol: Protocol, entry: ForwardEntry) {
        match self.by_local_port.entry(entry.local_port) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
            Entry::Occupied(mut slot) => {
                if *slot.get() == entry {
                    return;
                }
                let dropped = if entry < *slot.get() {
                    slot.insert(entry)
                } else {
                    entry
                };
                warn!(
                    "{} port {} is published by more than one container; keeping {}, ignoring {}:{}",
                    protocol,
                    dropped.local_port,
                    slot.get(),
                    dropped.remote_address,
                    dropped.remote_port
                );
            }
        }
    }

    fn into_rules(self) -> RuleSet {
        self.by_local_port.into_values().collect()
    }
}

fn protocol_of(port: &PublishedPort) -> Option<Protocol> {
    match port.protocol {
        PortProtocol::Tcp => Some(Protocol::Tcp),
        PortProtocol::Udp => Some(Protocol::Udp),
        PortProtocol::Other(_) => None,
    }
}

/// Host port of a mapping that is actually published.
fn public_port(port: &PublishedPort) -> Option<u16> {
    port.public_port.filter(|p| *p != 0)
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    request: impl Future<Output = RuntimeResult<T>>,
) -> RuntimeResult<T> {
    tokio::time::timeout(after, request)
        .await
        .map_err(|_| RuntimeError::Timeout { operation, after })?
}

/// Compute the desired rules from the running containers.
///
/// Every runtime request is bounded by `request_timeout`. Any runtime error
/// aborts the whole collection.
pub async fn collect_desired<R: ContainerRuntime>(
    runtime: &R,
    request_timeout: Duration,
) -> CollectorResult<DesiredState> {
    let containers = bounded("list", request_timeout, runtime.list_containers()).await?;

    let mut tcp = PortTable::default();
    let mut udp = PortTable::default();

    for container in &containers {
        let forwardable: Vec<(Protocol, u16, u16)> = container
            .published_ports
            .iter()
            .filter_map(|port| Some((protocol_of(port)?, public_port(port)?, port.private_port)))
            .collect();

        if forwardable.is_empty() {
            continue;
        }

        let details = bounded("inspect", request_timeout, runtime.inspect(&container.id)).await?;
        let Some(address) = details.reachable_address() else {
            debug!("Container {} has no reachable address, skipping", container.id);
            continue;
        };

        for (protocol, local_port, remote_port) in forwardable {
            let entry = ForwardEntry::new(local_port, address, remote_port);
            match protocol {
                Protocol::Tcp => tcp.insert(protocol, entry),
                Protocol::Udp => udp.insert(protocol, entry),
            }
        }
    }

    Ok(DesiredState {
        tcp: tcp.into_rules(),
        udp: udp.into_rules(),
    })
}
