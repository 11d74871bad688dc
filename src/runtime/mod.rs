//! Container runtime access.
//!
//! Reconciliation only needs three things from the runtime: the running
//! containers with their published ports, the network addresses of a single
//! container, and a stream of lifecycle events. [`ContainerRuntime`] is that
//! seam; [`DockerRuntime`] implements it against the Docker Engine API.

mod docker;
mod error;

use std::future::Future;

use futures::stream::BoxStream;

pub use docker::DockerRuntime;
pub use error::{RuntimeError, RuntimeResult};

/// Protocol of a published port as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortProtocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// Anything else (e.g. sctp). Never forwarded.
    Other(String),
}

/// One published port mapping of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Host-side port. `None` or zero when the port is exposed but not published.
    pub public_port: Option<u16>,
    /// Container-side port.
    pub private_port: u16,
    /// Declared protocol.
    pub protocol: PortProtocol,
}

/// A running container as listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container ID.
    pub id: String,
    /// Published port mappings.
    pub published_ports: Vec<PublishedPort>,
}

/// Address of a container on one attached network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Network name.
    pub name: String,
    /// Address on that network, if assigned.
    pub address: Option<String>,
}

/// Network details of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDetails {
    /// Top-level address (the default bridge address on Docker).
    pub primary_address: Option<String>,
    /// Attached networks in the order the runtime reported them.
    pub networks: Vec<NetworkAttachment>,
}

impl NetworkDetails {
    /// The address to forward to: a non-empty primary address, else the first
    /// non-empty address among attached networks.
    pub fn reachable_address(&self) -> Option<&str> {
        non_empty(self.primary_address.as_deref()).or_else(|| {
            self.networks
                .iter()
                .find_map(|n| non_empty(n.address.as_deref()))
        })
    }
}

fn non_empty(address: Option<&str>) -> Option<&str> {
    address.filter(|a| !a.is_empty())
}

/// A lifecycle event from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Resource kind (e.g. "container", "network").
    pub resource_type: String,
    /// Action (e.g. "start", "die").
    pub action: String,
}

impl LifecycleEvent {
    /// Convenience constructor for a container event.
    pub fn container(action: impl Into<String>) -> Self {
        Self {
            resource_type: "container".to_string(),
            action: action.into(),
        }
    }

    /// Whether this event concerns a container.
    pub fn is_container(&self) -> bool {
        self.resource_type == "container"
    }
}

/// Read access to the container runtime.
pub trait ContainerRuntime: Send + Sync {
    /// List running containers.
    fn list_containers(&self) -> impl Future<Output = RuntimeResult<Vec<ContainerSummary>>> + Send;

    /// Inspect the network attachments of one container.
    fn inspect(&self, id: &str) -> impl Future<Output = RuntimeResult<NetworkDetails>> + Send;

    /// Subscribe to lifecycle events. The stream ends or yields an error when
    /// the subscription breaks; callers re-subscribe.
    fn subscribe_events(&self) -> BoxStream<'static, RuntimeResult<LifecycleEvent>>;
}
