//! Device communication channels
//!
//! A channel is the device session's opaque link to the physical device:
//! one request datagram out, one reply in. Hosts that parse as IPv4
//! addresses get the pooled UDPX client; anything else is treated as a
//! serial port path.

use crate::error::{NetError, Result};
use crate::serial::SerialChannel;
use crate::udpx::SocketPool;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

pub enum Channel {
    Udpx(UdpxChannel),
    Serial(SerialChannel),
}

impl Channel {
    /// Pick a channel kind for the host and open it
    pub fn connect(host: &str, port: u16, pool: &SocketPool) -> Result<Self> {
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => Ok(Self::Udpx(UdpxChannel::new(
                SocketAddr::from((ip, port)),
                pool.clone(),
            ))),
            Err(_) => Ok(Self::Serial(SerialChannel::open(host)?)),
        }
    }

    /// One command round-trip: write the request, return the reply payload
    pub async fn exchange(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Udpx(channel) => channel.exchange(data).await,
            Self::Serial(channel) => channel.exchange(data.to_vec()).await,
        }
    }

    /// Override the retry timeout; serial links keep their fixed port
    /// timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        match self {
            Self::Udpx(channel) => channel.timeout = Some(timeout),
            Self::Serial(channel) => {
                debug!("timeout change ignored on serial channel {}", channel.host());
            }
        }
    }
}

/// UDPX client channel drawing sockets from the shared pool
pub struct UdpxChannel {
    addr: SocketAddr,
    pool: SocketPool,
    timeout: Option<Duration>,
}

impl UdpxChannel {
    pub fn new(addr: SocketAddr, pool: SocketPool) -> Self {
        Self {
            addr,
            pool,
            timeout: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn exchange(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut client = self.pool.client().await?;

        if let Some(timeout) = self.timeout {
            client.socket.set_timeout(timeout);
        }

        let reply = client.socket.exchange(data, self.addr).await?;

        // the device may answer from a fresh source port; keep following it,
        // but never a different host
        if let Some(peer) = client.socket.peer() {
            if peer.ip() != self.addr.ip() {
                return Err(NetError::InvalidPeer(peer));
            }
            self.addr = peer;
        }

        Ok(reply)
    }
}
