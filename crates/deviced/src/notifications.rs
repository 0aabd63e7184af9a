//! Notification intake server
//!
//! Devices push unsolicited notifications at the fixed UDP port. Each
//! datagram is acked first so the device's ARQ completes, then decoded,
//! attributed to a device session, and applied. Anything wrong with one
//! message is logged and skipped; only a socket-level failure stops the
//! server.

use sapphire_devices::DeviceRegistry;
use sapphire_net::protocol::Notification;
use sapphire_net::udpx::ServerSocket;
use sapphire_net::Result;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct NotificationServer {
    sock: ServerSocket,
    registry: DeviceRegistry,
}

impl NotificationServer {
    pub async fn bind(registry: DeviceRegistry, port: u16) -> Result<Self> {
        let sock = ServerSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        Ok(Self { sock, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        match self.local_addr() {
            Ok(addr) => info!("notification server listening on {}", addr),
            Err(_) => info!("notification server listening"),
        }

        loop {
            let incoming = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.sock.recv() => match result {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        error!("notification server socket failed: {}", e);
                        break;
                    }
                },
            };

            // ack immediately so the device's retry loop settles
            if let Err(e) = self.sock.reply(&incoming, &[]).await {
                warn!("notification ack to {} failed: {}", incoming.peer, e);
                continue;
            }

            self.handle(&incoming.payload, incoming.peer);
        }

        info!("notification server stopped");
    }

    fn handle(&self, payload: &[u8], peer: SocketAddr) {
        let msg = match Notification::unpack(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable notification from {}: {}", peer, e);
                return;
            }
        };

        let device = match self.registry.get(msg.device_id) {
            Some(device) => device,
            None => {
                info!("notification for unknown device {}", msg.device_id);
                return;
            }
        };

        if let Err(e) = device.receive_notification(&msg) {
            info!("notification from device {} rejected: {}", msg.device_id, e);
        }
    }
}
