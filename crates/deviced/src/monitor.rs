//! Per-device supervision
//!
//! Every discovered device gets one monitor task. The task installs the
//! notification server on the device, scans it, and then sits in a
//! one-second watchdog loop while the device stays online; two minutes of
//! notification silence trips the watchdog and the cycle restarts
//! immediately. Unreachable devices are retried on a one-minute backoff,
//! waking early when a notification flips them back online.
//!
//! The manager also forwards remote attribute writes on device objects
//! back into the hardware, so a peer process assigning a device parameter
//! reaches the device itself.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use sapphire_core::{Exchange, Signal};
use sapphire_devices::{Device, DeviceRegistry, DeviceStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

/// Notification silence that trips the watchdog
const WATCHDOG_TIMEOUT_SECS: i64 = 2 * 60;

/// Backoff before retrying an unreachable device
const RETRY_TIMEOUT_SECS: u64 = 60;

fn watchdog_expired(last_notification: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_notification > TimeDelta::seconds(WATCHDOG_TIMEOUT_SECS)
}

pub struct MonitorManager {
    exchange: Exchange,
    notification_port: u16,
    monitors: Mutex<HashMap<u64, JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    write_tx: mpsc::UnboundedSender<(Arc<Device>, String, Value)>,
}

impl MonitorManager {
    pub fn new(
        exchange: Exchange,
        registry: DeviceRegistry,
        notification_port: u16,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            exchange,
            notification_port,
            monitors: Mutex::new(HashMap::new()),
            shutdown,
            write_tx,
        });

        manager.register_write_through(registry);
        tokio::spawn(write_through_worker(write_rx));

        manager
    }

    /// Consume found-device signals from the scanner, creating one monitor
    /// per device.
    pub fn spawn_intake(
        self: &Arc<Self>,
        mut found_rx: mpsc::UnboundedReceiver<Arc<Device>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut shutdown = manager.shutdown.subscribe();

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    found = found_rx.recv() => match found {
                        Some(device) => manager.watch(device),
                        None => break,
                    },
                }
            }
        })
    }

    /// Start supervising a device; repeat announcements are ignored.
    pub fn watch(&self, device: Arc<Device>) {
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&device.device_id()) {
            return;
        }

        info!("adding device: {}", device.device_id());

        let handle = tokio::spawn(monitor_device(
            device.clone(),
            self.exchange.clone(),
            self.notification_port,
            self.shutdown.subscribe(),
        ));
        monitors.insert(device.device_id(), handle);
    }

    pub fn stop(&self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }

    /// Remote events assigning a device parameter are pushed to the
    /// hardware; attributes the device does not export are left alone.
    fn register_write_through(self: &Arc<Self>, registry: DeviceRegistry) {
        let write_tx = self.write_tx.clone();

        self.exchange
            .dispatcher()
            .connect(Signal::ReceivedEvent, move |event_ref| {
                let event = &event_ref.event;
                if event.is_private() {
                    return;
                }

                let device_id: u64 = match event.object_id.parse() {
                    Ok(id) => id,
                    Err(_) => return,
                };

                if let Some(device) = registry.get(device_id) {
                    if device.has_param(&event.key) {
                        let _ = write_tx.send((
                            device,
                            event.key.clone(),
                            event.value.clone(),
                        ));
                    }
                }
            });
    }
}

async fn write_through_worker(
    mut write_rx: mpsc::UnboundedReceiver<(Arc<Device>, String, Value)>,
) {
    while let Some((device, key, value)) = write_rx.recv().await {
        debug!("write-through {} = {} on {}", key, value, device.device_id());

        if let Err(e) = device.set_key(&key, value).await {
            info!(
                "write-through of {} to device {} failed: {}",
                key,
                device.device_id(),
                e
            );
        }
    }
}

/// Install the notification server on the device and bring its state up
async fn bring_online(device: &Device, notification_port: u16) -> sapphire_devices::Result<()> {
    device
        .set_kv_server(Ipv4Addr::UNSPECIFIED, notification_port)
        .await?;
    device.scan().await?;
    device.get_all_kv().await?;
    Ok(())
}

async fn monitor_device(
    device: Arc<Device>,
    exchange: Exchange,
    notification_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("device monitor {} running", device.device_id());

    'monitor: loop {
        let mut retry_timeout = RETRY_TIMEOUT_SECS;

        match bring_online(&device, notification_port).await {
            Ok(()) => {
                device.touch_notification();
                exchange.publish(device.object());
                info!("device {} online", device.device_id());

                // watchdog: tick while online, trip on notification silence
                loop {
                    tokio::select! {
                        _ = sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.recv() => break 'monitor,
                    }

                    if device.status() != DeviceStatus::Online {
                        break;
                    }

                    if watchdog_expired(device.last_notification_at(), Utc::now()) {
                        info!("device {} watchdog timeout", device.device_id());
                        retry_timeout = 0;
                        break;
                    }
                }

                device.set_status(DeviceStatus::Offline);
                info!("device {} offline", device.device_id());
            }
            Err(e) => {
                info!("device {} unreachable: {}", device.device_id(), e);
            }
        }

        // back off before the next attempt, waking early if notifications
        // bring the device back
        for _ in 0..retry_timeout {
            tokio::select! {
                _ = sleep(Duration::from_secs(1)) => {}
                _ = shutdown.recv() => break 'monitor,
            }

            if device.status() == DeviceStatus::Online {
                break;
            }
        }
    }

    info!("device monitor {} stopped", device.device_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapphire_core::Store;
    use sapphire_net::data::{KvMetaEntry, KvParam};
    use sapphire_net::protocol::{DeviceCommand, DeviceReply};
    use sapphire_net::types::{KvValue, WireType};
    use sapphire_net::udpx::{ServerSocket, SocketPool};
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use uuid::Uuid;

    #[test]
    fn test_watchdog_boundary() {
        let now = Utc::now();

        assert!(!watchdog_expired(now - TimeDelta::seconds(119), now));
        assert!(!watchdog_expired(now - TimeDelta::seconds(120), now));
        assert!(watchdog_expired(now - TimeDelta::seconds(121), now));
    }

    /// A scripted device answering everything bring_online needs
    async fn fake_device() -> SocketAddr {
        let server = ServerSocket::bind(std::net::SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut fwinfo = BytesMut::new();
        sapphire_net::data::FirmwareInfo {
            firmware_length: 1,
            firmware_id: Uuid::new_v4(),
            os_name: "sapphire os".into(),
            os_version: "1.0".into(),
            app_name: "relay".into(),
            app_version: "1.1".into(),
        }
        .pack(&mut fwinfo);
        let fwinfo = fwinfo.to_vec();

        let mut kvmeta = BytesMut::new();
        for entry in [
            KvMetaEntry {
                group: 1,
                id: 1,
                ty: WireType::String128,
                flags: 0,
                param_name: "name".into(),
            },
            KvMetaEntry {
                group: 1,
                id: 2,
                ty: WireType::Uint16,
                flags: 0,
                param_name: "short_addr".into(),
            },
        ] {
            entry.pack(&mut kvmeta);
        }
        let kvmeta = kvmeta.to_vec();

        tokio::spawn(async move {
            loop {
                let incoming = server.recv().await.unwrap();
                let reply = match DeviceCommand::unpack(&incoming.payload).unwrap() {
                    DeviceCommand::SetKvServer { .. } => DeviceReply::SetKvServer,
                    DeviceCommand::GetFileId { name } => DeviceReply::GetFileId {
                        file_id: match name.as_str() {
                            "fwinfo" => 1,
                            "kvmeta" => 2,
                            _ => -1,
                        },
                    },
                    DeviceCommand::ReadFileData { file_id, .. } => DeviceReply::ReadFileData {
                        data: match file_id {
                            1 => fwinfo.clone(),
                            2 => kvmeta.clone(),
                            _ => Vec::new(),
                        },
                    },
                    DeviceCommand::GetKv { requests } => DeviceReply::GetKv {
                        params: requests
                            .iter()
                            .map(|r| KvParam {
                                group: r.group,
                                id: r.id,
                                ty: r.ty,
                                value: match r.ty {
                                    WireType::String128 => KvValue::Text("relay1".into()),
                                    _ => KvValue::Uint(3),
                                },
                            })
                            .collect(),
                    },
                    _ => DeviceReply::ResetCfg,
                };
                server
                    .reply(&incoming, &reply.pack().unwrap())
                    .await
                    .unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_bring_online() {
        let addr = fake_device().await;

        let exchange = Exchange::new();
        let dir = tempfile::tempdir().unwrap().into_path();
        let store = Arc::new(Store::open(dir).unwrap());
        let pool = SocketPool::new();

        let device = Device::new(
            &exchange,
            &store,
            &pool,
            "127.0.0.1",
            addr.port(),
            3,
            777,
        )
        .unwrap();

        bring_online(&device, 59999).await.unwrap();

        assert_eq!(device.status(), DeviceStatus::Online);
        assert_eq!(device.name(), "relay1");
        assert!(device.has_param("short_addr"));
    }

    #[tokio::test]
    async fn test_watch_is_idempotent() {
        let exchange = Exchange::new();
        let registry = DeviceRegistry::new();
        let dir = tempfile::tempdir().unwrap().into_path();
        let store = Arc::new(Store::open(dir).unwrap());
        let pool = SocketPool::new();

        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = MonitorManager::new(exchange.clone(), registry, 59999, shutdown_tx);

        let device =
            Device::new(&exchange, &store, &pool, "127.0.0.1", 16385, 1, 55).unwrap();

        manager.watch(device.clone());
        manager.watch(device.clone());
        assert_eq!(manager.monitors.lock().len(), 1);

        manager.stop();
    }
}
