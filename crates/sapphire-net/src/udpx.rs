//! UDPX reliable datagrams
//!
//! A 2-byte header on top of UDP giving acknowledged, idempotent
//! request/reply exchanges. The client picks a random 8-bit id and retries
//! with a growing timeout; the only datagram accepted as the reply carries
//! `version 0, server=1, ack=1, ack_request=0` and the request id. Anything
//! else is ignored and counts toward the timeout. Servers mirror the id
//! back in their ack.
//!
//! Header bit layout, MSB first: version (2 bits, must be 0), server flag,
//! ack-request, ack, 3 reserved bits, then the 8-bit id.

use crate::error::{NetError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

const VERSION: u8 = 0;

pub const DEFAULT_TRIES: u32 = 5;
pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const TIMEOUT_INCREMENT: Duration = Duration::from_millis(100);

/// Concurrent client sockets per process; excess callers queue
pub const POOL_SIZE: usize = 4;

const RECV_BUFFER: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub server: bool,
    pub ack_request: bool,
    pub ack: bool,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Client request carrying application data
    pub fn request(id: u8, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            server: false,
            ack_request: true,
            ack: false,
            id,
            payload,
        }
    }

    /// Server acknowledgment mirroring a request id
    pub fn ack(id: u8, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            server: true,
            ack_request: false,
            ack: true,
            id,
            payload,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let flags = (self.version << 6)
            | ((self.server as u8) << 5)
            | ((self.ack_request as u8) << 4)
            | ((self.ack as u8) << 3);

        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(flags);
        out.push(self.id);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(NetError::Truncated {
                needed: 2,
                have: data.len(),
            });
        }

        Ok(Self {
            version: data[0] >> 6,
            server: data[0] & 0x20 != 0,
            ack_request: data[0] & 0x10 != 0,
            ack: data[0] & 0x08 != 0,
            id: data[1],
            payload: data[2..].to_vec(),
        })
    }

    /// The exact flag tuple a client accepts as its reply
    fn is_reply_to(&self, id: u8) -> bool {
        self.version == VERSION && self.server && self.ack && !self.ack_request && self.id == id
    }

    /// A well-formed client request as seen by the server
    fn is_request(&self) -> bool {
        self.version == VERSION && !self.server && !self.ack
    }
}

/// ARQ client over an ephemeral UDP socket
pub struct ClientSocket {
    sock: UdpSocket,
    tries: u32,
    initial_timeout: Duration,
    peer: Option<SocketAddr>,
    packets_resent: u32,
}

impl ClientSocket {
    pub async fn new() -> Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            sock,
            tries: DEFAULT_TRIES,
            initial_timeout: INITIAL_TIMEOUT,
            peer: None,
            packets_resent: 0,
        })
    }

    /// Override the initial retry timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.initial_timeout = timeout;
    }

    /// Total retransmissions over the socket's lifetime
    pub fn packets_resent(&self) -> u32 {
        self.packets_resent
    }

    /// Address the last valid reply came from; the peer may answer from a
    /// fresh source port.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send a datagram and wait for the matching acknowledgment, retrying
    /// with an increasing timeout until the budget runs out.
    pub async fn exchange(&mut self, data: &[u8], addr: SocketAddr) -> Result<Vec<u8>> {
        let request = Packet::request(rand::random(), data.to_vec());
        let packed = request.pack();

        let mut wait = self.initial_timeout;

        for attempt in 0..self.tries {
            if attempt > 0 {
                self.packets_resent += 1;
            }

            self.sock.send_to(&packed, addr).await?;

            let mut buf = [0u8; RECV_BUFFER];
            match timeout(wait, self.sock.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => match Packet::unpack(&buf[..n]) {
                    Ok(reply) if reply.is_reply_to(request.id) => {
                        self.peer = Some(from);
                        return Ok(reply.payload);
                    }
                    _ => {
                        // wrong flags or id: ignore, treat as a timeout
                        debug!("discarding unexpected datagram from {}", from);
                    }
                },
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {}
            }

            wait += TIMEOUT_INCREMENT;
        }

        Err(NetError::Timeout)
    }
}

/// One validated client request held by the server until it is acked
#[derive(Debug)]
pub struct Incoming {
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
    id: u8,
}

/// ARQ server side: validate requests, mirror ids into acks
pub struct ServerSocket {
    sock: UdpSocket,
}

impl ServerSocket {
    pub async fn bind(addr: impl Into<SocketAddr>) -> Result<Self> {
        let sock = UdpSocket::bind(addr.into()).await?;
        Ok(Self { sock })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Wait for the next well-formed client request. Datagrams with a bad
    /// version or flag tuple are logged and dropped.
    pub async fn recv(&self) -> Result<Incoming> {
        loop {
            let mut buf = [0u8; RECV_BUFFER];
            let (n, peer) = self.sock.recv_from(&mut buf).await?;

            match Packet::unpack(&buf[..n]) {
                Ok(packet) if packet.is_request() => {
                    return Ok(Incoming {
                        payload: packet.payload,
                        peer,
                        id: packet.id,
                    });
                }
                _ => debug!("dropping invalid packet from {}", peer),
            }
        }
    }

    /// Acknowledge a request, attaching the application's reply payload
    pub async fn reply(&self, incoming: &Incoming, data: &[u8]) -> Result<()> {
        let ack = Packet::ack(incoming.id, data.to_vec());
        self.sock.send_to(&ack.pack(), incoming.peer).await?;
        Ok(())
    }
}

/// Caps concurrent client sockets; callers beyond the limit queue on the
/// semaphore. One pool is shared by every channel in the process.
#[derive(Clone)]
pub struct SocketPool {
    permits: Arc<Semaphore>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(POOL_SIZE)),
        }
    }

    pub async fn client(&self) -> Result<PooledClient> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| NetError::PoolClosed)?;

        Ok(PooledClient {
            socket: ClientSocket::new().await?,
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A client socket holding one pool permit for its lifetime
pub struct PooledClient {
    pub socket: ClientSocket,
    _permit: OwnedSemaphorePermit,
}
