//! Network discovery
//!
//! On a fixed cadence the scanner broadcasts a gateway poll, collects the
//! replies for one second, and walks each gateway's device database. Every
//! device found gets a session in the registry and an object in the
//! exchange (published once), and is announced on the found-device signal
//! the monitor listens to. One failing gateway never stops the sweep.

use crate::device::Device;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex as SyncMutex;
use sapphire_core::{Exchange, Store};
use sapphire_net::protocol::{
    GatewayMessage, DEVICE_COMMAND_PORT, GATEWAY_SERVICES_PORT,
};
use sapphire_net::udpx::SocketPool;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(8);

/// How long replies to one discovery broadcast are collected
const DISCOVER_WINDOW: Duration = Duration::from_secs(1);

/// A gateway that answered the discovery broadcast
#[derive(Clone, Debug)]
pub struct GatewayHello {
    pub host: String,
    pub short_addr: u16,
    pub device_id: u64,
}

/// Broadcast a gateway poll and collect the replies arriving inside the
/// window. Duplicate answers from one gateway are dropped.
pub async fn discover_gateways(
    target: SocketAddr,
    window: Duration,
) -> Result<Vec<GatewayHello>> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.set_broadcast(true)?;

    let poll = GatewayMessage::PollGateway { short_addr: 0 }.pack();
    sock.send_to(&poll, target).await?;

    let deadline = Instant::now() + window;
    let mut gateways = Vec::new();
    let mut seen = HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let mut buf = [0u8; 1500];
        match timeout(remaining, sock.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => match GatewayMessage::unpack(&buf[..n]) {
                Ok(GatewayMessage::GatewayToken {
                    short_addr,
                    device_id,
                    ..
                }) => {
                    if seen.insert(device_id) {
                        gateways.push(GatewayHello {
                            host: from.ip().to_string(),
                            short_addr,
                            device_id,
                        });
                    }
                }
                Ok(other) => debug!("ignoring gateway message: {:?}", other),
                Err(e) => debug!("undecodable discovery reply from {}: {}", from, e),
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    Ok(gateways)
}

pub struct NetworkScanner {
    exchange: Exchange,
    registry: DeviceRegistry,
    pool: SocketPool,
    store: Arc<Store>,
    found_tx: mpsc::UnboundedSender<Arc<Device>>,
    scan_interval: Duration,
    broadcast_addr: Ipv4Addr,
    services_port: u16,
    command_port: u16,
    gateways: SyncMutex<HashMap<u64, Arc<Gateway>>>,
}

impl NetworkScanner {
    pub fn new(
        exchange: Exchange,
        registry: DeviceRegistry,
        pool: SocketPool,
        store: Arc<Store>,
        found_tx: mpsc::UnboundedSender<Arc<Device>>,
    ) -> Self {
        Self {
            exchange,
            registry,
            pool,
            store,
            found_tx,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            broadcast_addr: Ipv4Addr::BROADCAST,
            services_port: GATEWAY_SERVICES_PORT,
            command_port: DEVICE_COMMAND_PORT,
            gateways: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn services_port(mut self, port: u16) -> Self {
        self.services_port = port;
        self
    }

    pub fn command_port(mut self, port: u16) -> Self {
        self.command_port = port;
        self
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("network scanner started");

            loop {
                if let Err(e) = self.scan().await {
                    info!("network scan failed: {}", e);
                }

                tokio::select! {
                    _ = sleep(self.scan_interval) => {}
                    _ = shutdown.recv() => break,
                }
            }

            info!("network scanner stopped");
        })
    }

    /// One discovery sweep
    pub async fn scan(&self) -> Result<()> {
        let target = SocketAddr::from((self.broadcast_addr, self.services_port));
        let hellos = discover_gateways(target, DISCOVER_WINDOW).await?;

        for hello in hellos {
            if let Err(e) = self.scan_gateway(&hello).await {
                // an unreachable gateway must not stall the rest
                warn!("gateway {} scan failed: {}", hello.device_id, e);
            }
        }

        Ok(())
    }

    async fn scan_gateway(&self, hello: &GatewayHello) -> Result<()> {
        let device = self.ensure_device(&hello.host, hello.short_addr, hello.device_id)?;

        let gateway = self
            .gateways
            .lock()
            .entry(hello.device_id)
            .or_insert_with(|| Arc::new(Gateway::new(device.clone())))
            .clone();

        self.announce(&device);

        for entry in gateway.device_db().await? {
            if entry.device_id == hello.device_id {
                continue;
            }

            let child =
                self.ensure_device(&entry.ip.to_string(), entry.short_addr, entry.device_id)?;
            self.announce(&child);
        }

        Ok(())
    }

    fn ensure_device(&self, host: &str, short_addr: u16, device_id: u64) -> Result<Arc<Device>> {
        self.registry.get_or_insert(device_id, || {
            info!("found device {} at {}", device_id, host);
            Device::new(
                &self.exchange,
                &self.store,
                &self.pool,
                host,
                self.command_port,
                short_addr,
                device_id,
            )
        })
    }

    /// Publish the device once and raise the found-device signal
    fn announce(&self, device: &Arc<Device>) {
        if self
            .exchange
            .get(&device.device_id().to_string())
            .is_none()
        {
            self.exchange.publish(device.object());
        }

        let _ = self.found_tx.send(device.clone());
    }
}
