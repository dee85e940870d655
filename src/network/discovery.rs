//! UDP broadcast discovery of receivers
//!
//! A discovery round broadcasts one request datagram to every IPv4 broadcast
//! address of the local interfaces and collects responses until a deadline.
//! The [`AnnouncementListener`] keeps watching the port in the background
//! for discovery responses that arrive outside a round.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::protocol::{AnnouncementKind, BroadcastAnnouncement, ReceiverAnnouncement};

/// A receiver that answered discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredReceiver {
    /// Address the response came from
    pub address: SocketAddr,
    pub announcement: ReceiverAnnouncement,
}

/// IPv4 broadcast addresses of all non-loopback interfaces
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();

    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let get_if_addrs::IfAddr::V4(v4) = &iface.addr {
                    if let Some(broadcast) = v4.broadcast {
                        if !addresses.contains(&broadcast) {
                            addresses.push(broadcast);
                        }
                    }
                }
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate network interfaces: {}", e),
    }

    addresses
}

/// Bind a broadcast-capable UDP socket on all interfaces.
fn bind_broadcast_socket(port: u16, receive_buffer_bytes: usize) -> Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let bind_error = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_error)?;
    socket.set_broadcast(true).map_err(bind_error)?;
    socket.set_recv_buffer_size(receive_buffer_bytes).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Turn a datagram into a discovered receiver, or `None` if it is noise.
fn parse_response(datagram: &[u8], from: SocketAddr) -> Option<DiscoveredReceiver> {
    match BroadcastAnnouncement::decode_checked(datagram) {
        Ok(BroadcastAnnouncement {
            kind: AnnouncementKind::Response(announcement),
            ..
        }) => Some(DiscoveredReceiver {
            address: from,
            announcement,
        }),
        Ok(BroadcastAnnouncement {
            kind: AnnouncementKind::Request,
            ..
        }) => {
            tracing::trace!(%from, "Ignoring discovery request");
            None
        }
        Err(ProtocolError::MagicWordMismatch(word)) => {
            tracing::debug!(%from, "Discarding datagram with magic word {:#010x}", word);
            None
        }
        Err(e) => {
            tracing::debug!(%from, "Discarding malformed datagram ({} bytes): {}", datagram.len(), e);
            None
        }
    }
}

/// Socket for one discovery round
pub struct DiscoverySocket {
    socket: UdpSocket,
}

impl DiscoverySocket {
    /// Bind on `port`; 0 picks an ephemeral port.
    pub fn bind(port: u16, receive_buffer_bytes: usize) -> Result<Self> {
        Ok(Self {
            socket: bind_broadcast_socket(port, receive_buffer_bytes)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send the request to every interface broadcast address on `port`.
    ///
    /// Returns how many datagrams went out. Per-address failures are logged.
    pub async fn send_request(&self, port: u16) -> usize {
        let targets: Vec<SocketAddr> = broadcast_addresses()
            .into_iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
            .collect();

        if targets.is_empty() {
            tracing::warn!("No broadcast-capable network interfaces found");
        }
        self.send_request_to(&targets).await
    }

    /// Send the request to explicit addresses.
    pub async fn send_request_to(&self, targets: &[SocketAddr]) -> usize {
        let request = BroadcastAnnouncement::request().encode_to_vec();
        let mut sent = 0;
        for target in targets {
            match self.socket.send_to(&request, target).await {
                Ok(_) => {
                    tracing::debug!(%target, "Sent discovery request");
                    sent += 1;
                }
                Err(e) => tracing::warn!(%target, "Failed to send discovery request: {}", e),
            }
        }
        sent
    }

    /// Collect responses until `timeout` elapses, then close the socket.
    ///
    /// Only the overall deadline ends the round. Responses are kept in
    /// arrival order; one receiver answering twice shows up twice.
    pub async fn collect(self, timeout: Duration) -> Vec<DiscoveredReceiver> {
        let mut found = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(receiver) = parse_response(&buf[..len], from) {
                            tracing::info!(
                                receiver = %receiver.address,
                                "Discovered {}",
                                receiver.announcement
                            );
                            found.push(receiver);
                        }
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        tracing::debug!("Discovery receive error: {}", e);
                    }
                },
            }
        }

        drop(self.socket);
        found
    }
}

/// Run one discovery round on `port`.
pub async fn discover(port: u16, timeout: Duration) -> Result<Vec<DiscoveredReceiver>> {
    discover_with_buffer(port, timeout, MAX_DATAGRAM_SIZE).await
}

/// Like [`discover`], with an explicit socket receive buffer size.
pub async fn discover_with_buffer(
    port: u16,
    timeout: Duration,
    receive_buffer_bytes: usize,
) -> Result<Vec<DiscoveredReceiver>> {
    let socket = DiscoverySocket::bind(port, receive_buffer_bytes)?;
    let sent = socket.send_request(port).await;
    tracing::info!("Discovering receivers on port {} ({} broadcast targets)", port, sent);

    let found = socket.collect(timeout).await;
    tracing::info!("Discovery finished: {} response(s)", found.len());
    Ok(found)
}

/// Background listener for discovery responses outside a discovery round.
///
/// Only `BroadcastMessage` responses with the magic word are forwarded, for
/// example answers to a request sent by another transmitter. The periodic
/// `AudioReceiverAnnouncement` datagram of older receiver firmware is not
/// part of the shared schema and is discarded like any other noise.
///
/// Runs until [`stop`](Self::stop) is called or the handle is dropped.
pub struct AnnouncementListener {
    local_addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AnnouncementListener {
    /// Start listening on `port`. Must be called inside a tokio runtime.
    pub fn start(port: u16) -> Result<(Self, mpsc::Receiver<DiscoveredReceiver>)> {
        let socket = bind_broadcast_socket(port, MAX_DATAGRAM_SIZE)?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(Self::run(socket, tx, stop_rx));
        tracing::info!("Listening for receiver announcements on {}", local_addr);

        Ok((
            Self {
                local_addr,
                stop_tx: Some(stop_tx),
                task: Some(task),
            },
            rx,
        ))
    }

    async fn run(
        socket: UdpSocket,
        tx: mpsc::Sender<DiscoveredReceiver>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let Some(receiver) = parse_response(&buf[..len], from) else {
                            continue;
                        };
                        tracing::debug!(receiver = %from, "Announcement from {}", receiver.announcement);
                        if tx.send(receiver).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("Announcement receive error: {}", e),
                },
            }
        }
        tracing::debug!("Announcement listener stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop listening and wait for the socket to close.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AnnouncementListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
