//! Test doubles for the engine and runtime seams.
//!
//! Shared by the unit tests and the integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::forwarding::{EngineError, EngineResult, ForwardingEngine, Protocol};
use crate::runtime::{
    ContainerRuntime, ContainerSummary, LifecycleEvent, NetworkAttachment, NetworkDetails,
    PortProtocol, PublishedPort, RuntimeError, RuntimeResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call made on a [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// `start()`.
    Start(Protocol),
    /// `stop()`.
    Stop(Protocol),
    /// `add_entry(..)`, recorded whether or not it succeeded.
    Add {
        /// Engine protocol.
        protocol: Protocol,
        /// Local port.
        local_port: u16,
        /// Remote port.
        remote_port: u16,
        /// Remote address.
        remote_address: String,
    },
    /// `remove_entry(..)`.
    Remove {
        /// Engine protocol.
        protocol: Protocol,
        /// Local port.
        local_port: u16,
    },
    /// The engine was dropped.
    Destroy(Protocol),
}

#[derive(Default)]
struct LogState {
    calls: Vec<EngineCall>,
    failing_adds: HashSet<(Protocol, u16)>,
    failing_removes: HashSet<(Protocol, u16)>,
    failing_starts: HashSet<Protocol>,
}

/// Shared call log for a pair of recording engines, with failure injection.
#[derive(Clone, Default)]
pub struct EngineLog {
    state: Arc<Mutex<LogState>>,
}

impl EngineLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine for `protocol` that records into this log.
    pub fn engine(&self, protocol: Protocol) -> Box<dyn ForwardingEngine> {
        Box::new(RecordingEngine {
            protocol,
            log: self.clone(),
        })
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.state).calls.clone()
    }

    /// Only the add/remove calls.
    pub fn rule_calls(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Add { .. } | EngineCall::Remove { .. }))
            .collect()
    }

    /// Forget recorded calls (failure injection is kept).
    pub fn clear(&self) {
        lock(&self.state).calls.clear();
    }

    /// Make `add_entry` fail for this protocol and local port.
    pub fn fail_add(&self, protocol: Protocol, local_port: u16) {
        lock(&self.state).failing_adds.insert((protocol, local_port));
    }

    /// Let `add_entry` succeed again for this protocol and local port.
    pub fn heal_add(&self, protocol: Protocol, local_port: u16) {
        lock(&self.state).failing_adds.remove(&(protocol, local_port));
    }

    /// Make `remove_entry` fail for this protocol and local port.
    pub fn fail_remove(&self, protocol: Protocol, local_port: u16) {
        lock(&self.state).failing_removes.insert((protocol, local_port));
    }

    /// Make `start` fail for this protocol.
    pub fn fail_start(&self, protocol: Protocol) {
        lock(&self.state).failing_starts.insert(protocol);
    }

    fn record(&self, call: EngineCall) {
        lock(&self.state).calls.push(call);
    }
}

/// Engine that records every call into an [`EngineLog`].
pub struct RecordingEngine {
    protocol: Protocol,
    log: EngineLog,
}

impl ForwardingEngine for RecordingEngine {
    fn start(&mut self) -> EngineResult<()> {
        self.log.record(EngineCall::Start(self.protocol));
        if lock(&self.log.state).failing_starts.contains(&self.protocol) {
            return Err(EngineError::NotRunning);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.log.record(EngineCall::Stop(self.protocol));
    }

    fn add_entry(
        &mut self,
        local_port: u16,
        remote_port: u16,
        remote_address: &str,
    ) -> EngineResult<()> {
        self.log.record(EngineCall::Add {
            protocol: self.protocol,
            local_port,
            remote_port,
            remote_address: remote_address.to_string(),
        });
        if lock(&self.log.state)
            .failing_adds
            .contains(&(self.protocol, local_port))
        {
            return Err(EngineError::PortInUse(local_port));
        }
        Ok(())
    }

    fn remove_entry(&mut self, local_port: u16) -> EngineResult<()> {
        self.log.record(EngineCall::Remove {
            protocol: self.protocol,
            local_port,
        });
        if lock(&self.log.state)
            .failing_removes
            .contains(&(self.protocol, local_port))
        {
            return Err(EngineError::Io(std::io::Error::other("injected failure")));
        }
        Ok(())
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        self.log.record(EngineCall::Destroy(self.protocol));
    }
}

#[derive(Default)]
struct RuntimeState {
    containers: Vec<ContainerSummary>,
    details: HashMap<String, NetworkDetails>,
    fail_list: bool,
    fail_inspect: HashSet<String>,
    hang_list: bool,
    hang_inspect: HashSet<String>,
    subscriptions: VecDeque<Vec<RuntimeResult<LifecycleEvent>>>,
    subscribe_count: usize,
    list_count: usize,
}

/// In-memory container runtime. Clones share state.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl MockRuntime {
    /// Create a runtime with no containers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running container with the given ports and network details.
    pub fn add_container(&self, id: &str, ports: Vec<PublishedPort>, details: NetworkDetails) {
        let mut state = lock(&self.state);
        state.containers.push(ContainerSummary {
            id: id.to_string(),
            published_ports: ports,
        });
        state.details.insert(id.to_string(), details);
    }

    /// Remove a container.
    pub fn remove_container(&self, id: &str) {
        let mut state = lock(&self.state);
        state.containers.retain(|c| c.id != id);
        state.details.remove(id);
    }

    /// Replace the network details of a container.
    pub fn set_details(&self, id: &str, details: NetworkDetails) {
        lock(&self.state).details.insert(id.to_string(), details);
    }

    /// Make `list_containers` fail.
    pub fn set_fail_list(&self, fail: bool) {
        lock(&self.state).fail_list = fail;
    }

    /// Make `inspect` fail for one container.
    pub fn fail_inspect(&self, id: &str) {
        lock(&self.state).fail_inspect.insert(id.to_string());
    }

    /// Make `list_containers` never complete.
    pub fn hang_list(&self) {
        lock(&self.state).hang_list = true;
    }

    /// Make `inspect` never complete for one container.
    pub fn hang_inspect(&self, id: &str) {
        lock(&self.state).hang_inspect.insert(id.to_string());
    }

    /// Queue the items one event subscription will yield before ending.
    ///
    /// Once every queued subscription is used up, further subscriptions stay
    /// open without yielding anything.
    pub fn push_subscription(&self, items: Vec<RuntimeResult<LifecycleEvent>>) {
        lock(&self.state).subscriptions.push_back(items);
    }

    /// Number of times `subscribe_events` was called.
    pub fn subscribe_count(&self) -> usize {
        lock(&self.state).subscribe_count
    }

    /// Number of times `list_containers` was called.
    pub fn list_count(&self) -> usize {
        lock(&self.state).list_count
    }
}

impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let hang = {
            let mut state = lock(&self.state);
            state.list_count += 1;
            if state.fail_list {
                return Err(RuntimeError::Request {
                    operation: "list",
                    message: "runtime unavailable".to_string(),
                });
            }
            state.hang_list
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(lock(&self.state).containers.clone())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<NetworkDetails> {
        let hang = {
            let state = lock(&self.state);
            if state.fail_inspect.contains(id) {
                return Err(RuntimeError::Request {
                    operation: "inspect",
                    message: format!("no such container: {}", id),
                });
            }
            state.hang_inspect.contains(id)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(lock(&self.state).details.get(id).cloned().unwrap_or_default())
    }

    fn subscribe_events(&self) -> BoxStream<'static, RuntimeResult<LifecycleEvent>> {
        let mut state = lock(&self.state);
        state.subscribe_count += 1;
        match state.subscriptions.pop_front() {
            Some(items) => stream::iter(items).boxed(),
            None => stream::pending::<RuntimeResult<LifecycleEvent>>().boxed(),
        }
    }
}

/// A published TCP port.
pub fn tcp_port(public_port: u16, private_port: u16) -> PublishedPort {
    PublishedPort {
        public_port: Some(public_port),
        private_port,
        protocol: PortProtocol::Tcp,
    }
}

/// A published UDP port.
pub fn udp_port(public_port: u16, private_port: u16) -> PublishedPort {
    PublishedPort {
        public_port: Some(public_port),
        private_port,
        protocol: PortProtocol::Udp,
    }
}

/// Network details with only a primary address.
pub fn primary(address: &str) -> NetworkDetails {
    NetworkDetails {
        primary_address: Some(address.to_string()),
        networks: Vec::new(),
    }
}

/// Network details with only attached networks.
pub fn attached(networks: &[(&str, &str)]) -> NetworkDetails {
    NetworkDetails {
        primary_address: None,
        networks: networks
            .iter()
            .map(|(name, address)| NetworkAttachment {
                name: name.to_string(),
                address: Some(address.to_string()),
            })
            .collect(),
    }
}
