//! Status relay
//!
//! VPN client hook scripts report tunnel events as UDP datagrams of the
//! form `<channel> <status line>`. The relay republishes each one on the
//! in-process bus, where the tunnel's status listener picks it up.
//!
//! ```text
//! client hook ──udp──▶ relay ──publish──▶ LocalBus ──▶ StatusChannelListener
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use vpnmux_tunnel::status_channel::CHANNEL_PREFIX;
use vpnmux_tunnel::LocalBus;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 2048;

/// Split a datagram into channel and status line.
pub fn split_datagram(datagram: &str) -> Option<(&str, &str)> {
    let (channel, line) = datagram.trim().split_once(char::is_whitespace)?;
    let line = line.trim();
    if !channel.starts_with(CHANNEL_PREFIX) || channel.len() == CHANNEL_PREFIX.len() || line.is_empty() {
        return None;
    }
    Some((channel, line))
}

/// UDP listener feeding the bus.
pub struct StatusRelay {
    socket: UdpSocket,
    bus: Arc<LocalBus>,
}

impl StatusRelay {
    pub async fn bind(addr: SocketAddr, bus: Arc<LocalBus>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Status relay listening on {}", socket.local_addr()?);
        Ok(Self { socket, bus })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until the socket fails or the bus closes.
    pub async fn run(self) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            let Ok(datagram) = std::str::from_utf8(&buf[..len]) else {
                warn!("Dropping non-UTF-8 datagram from {}", peer);
                continue;
            };
            let Some((channel, line)) = split_datagram(datagram) else {
                warn!("Dropping malformed datagram from {}: {:?}", peer, datagram);
                continue;
            };

            debug!("{} <- {}: {}", channel, peer, line);
            if self.bus.publish(channel, line).is_err() {
                info!("Bus closed, status relay stopping");
                return Ok(());
            }
        }
    }
}
