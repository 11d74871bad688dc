//! TCP forwarding engine.
//!
//! Each rule binds a listener on the configured host address. Every accepted
//! connection gets its own task that dials the destination and copies bytes
//! in both directions until either side closes. Removing a rule closes the
//! listener; connections already established run to completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::debug;

use super::engine::{EngineOptions, ForwardingEngine, resolve_remote};
use super::error::{EngineError, EngineResult};
use super::slot::{PortForward, SocketSlot};

/// Forwards TCP ports using tokio tasks.
pub struct TcpEngine {
    options: EngineOptions,
    /// Runtime the forwarding tasks are spawned on. `Some` while running.
    runtime: Option<Handle>,
    forwards: HashMap<u16, PortForward<TcpListener>>,
}

impl TcpEngine {
    /// Create a stopped engine.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            runtime: None,
            forwards: HashMap::new(),
        }
    }

    /// Local ports currently forwarded.
    pub fn forwarded_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.forwards.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl ForwardingEngine for TcpEngine {
    fn start(&mut self) -> EngineResult<()> {
        if self.runtime.is_none() {
            let handle = Handle::try_current().map_err(|e| EngineError::NoRuntime(e.to_string()))?;
            self.runtime = Some(handle);
        }
        Ok(())
    }

    fn stop(&mut self) {
        for (_, forward) in self.forwards.drain() {
            forward.close();
        }
        self.runtime = None;
    }

    fn add_entry(
        &mut self,
        local_port: u16,
        remote_port: u16,
        remote_address: &str,
    ) -> EngineResult<()> {
        let runtime = self.runtime.as_ref().ok_or(EngineError::NotRunning)?;
        let target = resolve_remote(remote_address, remote_port)?;
        if self.forwards.contains_key(&local_port) {
            return Err(EngineError::PortInUse(local_port));
        }

        // Bind synchronously so a taken port is reported to the caller.
        let addr = SocketAddr::new(self.options.bind_address, local_port);
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|source| EngineError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let slot = SocketSlot::new(listener);
        let task = runtime.spawn(accept_loop(
            slot.clone(),
            target,
            self.options.connect_timeout,
        ));
        self.forwards.insert(local_port, PortForward::new(slot, task));

        debug!("TCP listener on {} -> {}", addr, target);
        Ok(())
    }

    fn remove_entry(&mut self, local_port: u16) -> EngineResult<()> {
        if let Some(forward) = self.forwards.remove(&local_port) {
            forward.close();
            debug!("TCP listener on port {} closed", local_port);
        }
        Ok(())
    }
}

impl Drop for TcpEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept connections until the listener is closed.
async fn accept_loop(
    listener: SocketSlot<TcpListener>,
    target: SocketAddr,
    connect_timeout: Duration,
) {
    while let Some(accepted) = listener.poll(|l, cx| l.poll_accept(cx)).await {
        match accepted {
            Ok((stream, peer_addr)) => {
                debug!("TCP connection from {} for {}", peer_addr, target);
                tokio::spawn(forward_connection(stream, target, connect_timeout));
            }
            Err(e) => {
                debug!("Accept error: {}", e);
            }
        }
    }
}

/// Forward a single connection.
async fn forward_connection(mut client: TcpStream, target: SocketAddr, connect_timeout: Duration) {
    let mut upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Failed to connect to {}: {}", target, e);
            let _ = client.shutdown().await;
            return;
        }
        Err(_) => {
            debug!("Timed out connecting to {}", target);
            let _ = client.shutdown().await;
            return;
        }
    };

    // Each direction's write side is shut down when its read side hits EOF,
    // so a half-closed client still receives the reply.
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(
                "TCP connection to {} closed ({} bytes out, {} bytes in)",
                target, sent, received
            );
        }
        Err(e) => {
            debug!("TCP connection to {} ended: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_add_before_start() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        let err = engine.add_entry(18080, 80, "127.0.0.1").unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[test]
    fn test_start_outside_runtime() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        assert!(matches!(engine.start(), Err(EngineError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_duplicate_port() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let port = free_port();

        engine.add_entry(port, 80, "127.0.0.1").unwrap();
        let err = engine.add_entry(port, 81, "127.0.0.1").unwrap_err();
        assert!(matches!(err, EngineError::PortInUse(p) if p == port));
        assert_eq!(engine.forwarded_ports(), vec![port]);
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let err = engine.add_entry(free_port(), 80, "not-an-ip").unwrap_err();
        assert!(matches!(err, EngineError::NameResolution { .. }));
        assert!(engine.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let err = engine.add_entry(port, 80, "127.0.0.1").unwrap_err();
        assert!(matches!(err, EngineError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_forwards_bytes() {
        let upstream_port = echo_server().await;
        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let port = free_port();
        engine.add_entry(port, upstream_port, "127.0.0.1").unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_reply_after_client_half_close() {
        // Answers only once the request side reaches EOF.
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = server.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"req");
            stream.write_all(b"reply").await.unwrap();
        });

        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let port = free_port();
        engine.add_entry(port, upstream_port, "127.0.0.1").unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"req").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, b"reply");
    }

    #[tokio::test]
    async fn test_remove_then_rebind_same_port() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let port = free_port();

        engine.add_entry(port, 80, "127.0.0.1").unwrap();
        engine.remove_entry(port).unwrap();
        engine.add_entry(port, 81, "127.0.0.1").unwrap();
        assert_eq!(engine.forwarded_ports(), vec![port]);

        // Unknown ports are ignored.
        engine.remove_entry(1).unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_ports() {
        let mut engine = TcpEngine::new(EngineOptions::default());
        engine.start().unwrap();
        let port = free_port();
        engine.add_entry(port, 80, "127.0.0.1").unwrap();

        engine.stop();
        assert!(engine.forwarded_ports().is_empty());
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        assert!(matches!(
            engine.add_entry(port, 80, "127.0.0.1"),
            Err(EngineError::NotRunning)
        ));
    }
}
