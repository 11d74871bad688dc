//! UDP forwarding engine.
//!
//! UDP has no connections, so each rule tracks client sessions itself: the
//! first datagram from a client address opens an upstream socket connected to
//! the destination, and replies arriving on that socket are sent back to the
//! client from the local port. Sessions idle for longer than the configured
//! timeout are dropped.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::engine::{EngineOptions, ForwardingEngine, resolve_remote};
use super::error::{EngineError, EngineResult};
use super::slot::{PortForward, SocketSlot};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;

/// Replies waiting to be sent from one local port.
const REPLY_QUEUE: usize = 64;

/// Forwards UDP ports using tokio tasks.
pub struct UdpEngine {
    options: EngineOptions,
    runtime: Option<Handle>,
    forwards: HashMap<u16, PortForward<UdpSocket>>,
}

impl UdpEngine {
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

impl ForwardingEngine for UdpEngine {
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

        let addr = SocketAddr::new(self.options.bind_address, local_port);
        let socket =
            std::net::UdpSocket::bind(addr).map_err(|source| EngineError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;

        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(socket)?
        };

        let slot = SocketSlot::new(socket);
        let task = runtime.spawn(relay_port(
            slot.clone(),
            target,
            self.options.udp_session_timeout,
        ));
        self.forwards.insert(local_port, PortForward::new(slot, task));

        debug!("UDP socket on {} -> {}", addr, target);
        Ok(())
    }

    fn remove_entry(&mut self, local_port: u16) -> EngineResult<()> {
        if let Some(forward) = self.forwards.remove(&local_port) {
            forward.close();
            debug!("UDP socket on port {} closed", local_port);
        }
        Ok(())
    }
}

impl Drop for UdpEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A reply from the destination, addressed to a client.
type Reply = (SocketAddr, Vec<u8>);

/// One client talking through a forwarded port.
struct UdpSession {
    upstream: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    replies: JoinHandle<()>,
}

impl UdpSession {
    /// Open an upstream socket for `client` and start relaying its replies.
    async fn open(
        client: SocketAddr,
        target: SocketAddr,
        reply_tx: mpsc::Sender<Reply>,
    ) -> std::io::Result<Self> {
        let unspecified = match target.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let upstream = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        upstream.connect(target).await?;

        let upstream = Arc::new(upstream);
        let last_active = Arc::new(Mutex::new(Instant::now()));
        let replies = tokio::spawn(relay_replies(
            Arc::clone(&upstream),
            client,
            reply_tx,
            Arc::clone(&last_active),
        ));

        Ok(Self {
            upstream,
            last_active,
            replies,
        })
    }

    fn touch(&self) {
        touch(&self.last_active);
    }

    fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.replies.abort();
    }
}

fn touch(last_active: &Mutex<Instant>) {
    *last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
}

/// Relay client datagrams to the destination and replies back to the
/// clients until the local socket is closed. All sends on the local socket
/// happen here.
async fn relay_port(local: SocketSlot<UdpSocket>, target: SocketAddr, session_timeout: Duration) {
    let mut sessions: HashMap<SocketAddr, UdpSession> = HashMap::new();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(REPLY_QUEUE);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(session_timeout);

    loop {
        tokio::select! {
            received = local.poll(|socket, cx| {
                let mut read = ReadBuf::new(&mut buf);
                socket
                    .poll_recv_from(cx, &mut read)
                    .map_ok(|client| (client, read.filled().len()))
            }) => {
                match received {
                    None => break,
                    Some(Ok((client, len))) => {
                        let payload = &buf[..len];
                        let forwarded =
                            forward_datagram(&mut sessions, &reply_tx, client, target, payload).await;
                        if let Err(e) = forwarded {
                            debug!("UDP datagram from {} to {} dropped: {}", client, target, e);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("UDP receive error: {}", e);
                    }
                }
            }
            Some((client, payload)) = reply_rx.recv() => {
                match local
                    .poll(|socket, cx| socket.poll_send_to(cx, &payload, client))
                    .await
                {
                    None => break,
                    Some(Err(e)) => debug!("UDP reply to {} failed: {}", client, e),
                    Some(Ok(_)) => {}
                }
            }
            _ = sweep.tick() => {
                sessions.retain(|client, session| {
                    let keep = session.idle_for() < session_timeout;
                    if !keep {
                        debug!("UDP session for {} expired", client);
                    }
                    keep
                });
            }
        }
    }
}

async fn forward_datagram(
    sessions: &mut HashMap<SocketAddr, UdpSession>,
    reply_tx: &mpsc::Sender<Reply>,
    client: SocketAddr,
    target: SocketAddr,
    payload: &[u8],
) -> std::io::Result<()> {
    if !sessions.contains_key(&client) {
        let session = UdpSession::open(client, target, reply_tx.clone()).await?;
        debug!("UDP session for {} -> {}", client, target);
        sessions.insert(client, session);
    }

    if let Some(session) = sessions.get(&client) {
        session.touch();
        session.upstream.send(payload).await?;
    }
    Ok(())
}

/// Whether an upstream receive error leaves the session usable.
///
/// Connected UDP sockets report ICMP port unreachable as `ConnectionRefused`
/// on the next receive; the destination may come up later.
fn is_transient(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::ConnectionRefused
}

/// Queue destination replies for the local socket until the session ends.
async fn relay_replies(
    upstream: Arc<UdpSocket>,
    client: SocketAddr,
    reply_tx: mpsc::Sender<Reply>,
    last_active: Arc<Mutex<Instant>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match upstream.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) if is_transient(&e) => {
                debug!("UDP upstream for {} unreachable: {}", client, e);
                continue;
            }
            Err(e) => {
                debug!("UDP upstream receive for {} failed, ending relay: {}", client, e);
                break;
            }
        };
        touch(&last_active);

        if reply_tx.send((client, buf[..len].to_vec())).await.is_err() {
            break;
        }
    }
}
