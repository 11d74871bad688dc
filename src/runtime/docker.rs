//! Docker Engine implementation of [`ContainerRuntime`].

use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{
    ContainerInspectResponse, EventMessage, EventMessageTypeEnum, Port, PortTypeEnum,
};
use bollard::system::EventsOptions;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::debug;

use super::error::{RuntimeError, RuntimeResult};
use super::{
    ContainerRuntime, ContainerSummary, LifecycleEvent, NetworkAttachment, NetworkDetails,
    PortProtocol, PublishedPort,
};

/// Container runtime backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the platform socket)
    /// and verify the daemon answers.
    pub async fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Connect(format!("Docker ping failed: {}", e)))?;

        debug!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Request {
                operation: "list",
                message: e.to_string(),
            })?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let published_ports = c
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .map(published_port)
                    .collect();
                Some(ContainerSummary {
                    id,
                    published_ports,
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<NetworkDetails> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::Request {
                operation: "inspect",
                message: e.to_string(),
            })?;

        Ok(network_details(response))
    }

    fn subscribe_events(&self) -> BoxStream<'static, RuntimeResult<LifecycleEvent>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .map(|result| {
                result
                    .map(lifecycle_event)
                    .map_err(|e| RuntimeError::Stream(e.to_string()))
            })
            .boxed()
    }
}

fn published_port(port: &Port) -> PublishedPort {
    let protocol = match &port.typ {
        Some(PortTypeEnum::TCP) => PortProtocol::Tcp,
        Some(PortTypeEnum::UDP) => PortProtocol::Udp,
        Some(other) => PortProtocol::Other(format!("{:?}", other).to_lowercase()),
        None => PortProtocol::Other(String::new()),
    };

    PublishedPort {
        public_port: port.public_port,
        private_port: port.private_port,
        protocol,
    }
}

fn network_details(response: ContainerInspectResponse) -> NetworkDetails {
    let Some(settings) = response.network_settings else {
        return NetworkDetails::default();
    };

    // The API returns networks as a map; sort by name so the fallback
    // address is stable from pass to pass.
    let mut networks: Vec<NetworkAttachment> = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| NetworkAttachment {
            name,
            address: endpoint.ip_address,
        })
        .collect();
    networks.sort_by(|a, b| a.name.cmp(&b.name));

    NetworkDetails {
        primary_address: settings.ip_address,
        networks,
    }
}

fn lifecycle_event(message: EventMessage) -> LifecycleEvent {
    let resource_type = match message.typ {
        Some(EventMessageTypeEnum::CONTAINER) => "container".to_string(),
        Some(other) => format!("{:?}", other).to_lowercase(),
        None => String::new(),
    };

    LifecycleEvent {
        resource_type,
        action: message.action.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EndpointSettings, NetworkSettings};

    #[test]
    fn test_published_port_mapping() {
        let port = Port {
            private_port: 80,
            public_port: Some(8080),
            typ: Some(PortTypeEnum::TCP),
            ..Default::default()
        };
        let mapped = published_port(&port);
        assert_eq!(mapped.public_port, Some(8080));
        assert_eq!(mapped.private_port, 80);
        assert_eq!(mapped.protocol, PortProtocol::Tcp);

        let sctp = Port {
            private_port: 9,
            typ: Some(PortTypeEnum::SCTP),
            ..Default::default()
        };
        assert_eq!(
            published_port(&sctp).protocol,
            PortProtocol::Other("sctp".to_string())
        );
    }

    #[test]
    fn test_network_details_sorted_by_name() {
        let mut networks = HashMap::new();
        networks.insert(
            "zeta".to_string(),
            EndpointSettings {
                ip_address: Some("172.30.0.2".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "alpha".to_string(),
            EndpointSettings {
                ip_address: Some("172.20.0.2".to_string()),
                ..Default::default()
            },
        );

        let response = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ip_address: Some(String::new()),
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let details = network_details(response);
        assert_eq!(details.networks[0].name, "alpha");
        assert_eq!(details.reachable_address(), Some("172.20.0.2"));
    }

    #[test]
    fn test_missing_network_settings() {
        let details = network_details(ContainerInspectResponse::default());
        assert_eq!(details, NetworkDetails::default());
    }

    #[test]
    fn test_lifecycle_event_mapping() {
        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("restart".to_string()),
            ..Default::default()
        };
        assert_eq!(lifecycle_event(message), LifecycleEvent::container("restart"));
    }
}
