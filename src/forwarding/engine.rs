//! The forwarding engine seam.
//!
//! An engine owns the actual packet forwarding for one protocol. The store
//! only ever talks to it through this trait, so the concrete TCP/UDP engines
//! and the test doubles are interchangeable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::error::{EngineError, EngineResult};

/// Default idle timeout for a UDP client session.
pub const DEFAULT_UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for connecting to a TCP destination.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarding primitives for a single protocol.
///
/// Destroying an engine is dropping it. Engines must accept rule changes while
/// running and must tolerate being stopped and dropped after being started.
pub trait ForwardingEngine: Send {
    /// Start servicing rules.
    fn start(&mut self) -> EngineResult<()>;

    /// Stop servicing rules and release every bound port.
    fn stop(&mut self);

    /// Begin forwarding `local_port` to `remote_address:remote_port`.
    fn add_entry(
        &mut self,
        local_port: u16,
        remote_port: u16,
        remote_address: &str,
    ) -> EngineResult<()>;

    /// Stop forwarding `local_port`. Removing an unknown port is not an error.
    fn remove_entry(&mut self, local_port: u16) -> EngineResult<()>;
}

/// Settings shared by the concrete engines.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Host address the local side of each rule binds to.
    pub bind_address: IpAddr,
    /// Timeout for establishing a TCP connection to the destination.
    pub connect_timeout: Duration,
    /// Idle time after which a UDP client session is dropped.
    pub udp_session_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_session_timeout: DEFAULT_UDP_SESSION_TIMEOUT,
        }
    }
}

/// Parse a destination literal into a socket address.
pub(crate) fn resolve_remote(remote_address: &str, remote_port: u16) -> EngineResult<SocketAddr> {
    remote_address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, remote_port))
        .map_err(|_| EngineError::NameResolution {
            address: remote_address.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ipv4() {
        let addr = resolve_remote("10.0.0.2", 80).unwrap();
        assert_eq!(addr, "10.0.0.2:80".parse().unwrap());
    }

    #[test]
    fn test_resolve_ipv6() {
        let addr = resolve_remote("fd00::2", 443).unwrap();
        assert_eq!(addr, "[fd00::2]:443".parse().unwrap());
    }

    #[test]
    fn test_resolve_rejects_hostnames() {
        let err = resolve_remote("db.internal", 5432).unwrap_err();
        assert!(matches!(err, EngineError::NameResolution { .. }));
    }

    #[test]
    fn test_default_options() {
        let opts = EngineOptions::default();
        assert_eq!(opts.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(opts.udp_session_timeout, Duration::from_secs(30));
    }
}
