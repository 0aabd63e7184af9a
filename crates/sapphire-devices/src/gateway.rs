//! Gateway devices
//!
//! A gateway is a device running the reserved gateway firmware. Beyond the
//! normal session it bridges the wireless segment: it serves the device
//! database other devices are discovered through, and the network-time
//! base used to translate device-local microsecond counters into absolute
//! timestamps.

use crate::device::{ntp_to_utc, Device};
use crate::error::{DeviceError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex as SyncMutex;
use sapphire_net::data::{unpack_array, ArpEntry, BridgeEntry, DeviceDbEntry, NtpTimestamp};
use sapphire_net::protocol::{GatewayMessage, GATEWAY_SERVICES_UDPX_PORT};
use sapphire_net::udpx::ClientSocket;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Firmware UUID reserved for gateways
pub const GATEWAY_FIRMWARE_ID: &str = "e966b682-ce7c-4c80-8373-2f1ee344e39d";

pub const NET_TIME_FLAG_WCOM_SYNC: u8 = 0x01;
pub const NET_TIME_FLAG_NTP_SYNC: u8 = 0x02;
pub const NET_TIME_FLAG_VALID: u8 = 0x04;

/// A time base pair is trusted for at most this long after a resync
const NETWORK_SYNC_VALID_SECS: i64 = 5 * 60;

/// True when the firmware id names a gateway image
pub fn is_gateway_firmware(firmware_id: &str) -> bool {
    firmware_id == GATEWAY_FIRMWARE_ID
}

/// Correlated network-time and wall-clock base
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeBase {
    /// Device-network microsecond counter at the sync point
    pub network_time: u32,
    /// NTP-derived wall clock at the sync point
    pub ntp_base: DateTime<Utc>,
}

pub struct Gateway {
    device: Arc<Device>,
    services_port: u16,
    time_base: SyncMutex<Option<TimeBase>>,
}

impl Gateway {
    pub fn new(device: Arc<Device>) -> Self {
        Self::with_services_port(device, GATEWAY_SERVICES_UDPX_PORT)
    }

    pub fn with_services_port(device: Arc<Device>, services_port: u16) -> Self {
        Self {
            device,
            services_port,
            time_base: SyncMutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The gateway's view of the wireless segment
    pub async fn device_db(&self) -> Result<Vec<DeviceDbEntry>> {
        let data = self.device.get_file("devicedb").await?;
        Ok(unpack_array(&data, DeviceDbEntry::unpack)?)
    }

    pub async fn bridge_info(&self) -> Result<Vec<BridgeEntry>> {
        let data = self.device.get_file("bridge").await?;
        Ok(unpack_array(&data, BridgeEntry::unpack)?)
    }

    pub async fn arp_info(&self) -> Result<Vec<ArpEntry>> {
        let data = self.device.get_file("arp_cache").await?;
        Ok(unpack_array(&data, ArpEntry::unpack)?)
    }

    fn services_addr(&self) -> Result<SocketAddr> {
        let host = self.device.host();
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| DeviceError::Unreachable(format!("gateway host {}", host)))?;
        Ok(SocketAddr::from((ip, self.services_port)))
    }

    /// Fetch a fresh time base from the gateway. An answer without the
    /// VALID flag clears the stored base.
    pub async fn network_time(&self) -> Result<Option<TimeBase>> {
        let addr = self.services_addr()?;

        let mut sock = ClientSocket::new().await?;
        let data = sock
            .exchange(&GatewayMessage::GetNetworkTime.pack(), addr)
            .await
            .map_err(|e| DeviceError::Unreachable(format!("gateway {}: {}", addr, e)))?;

        match GatewayMessage::unpack(&data)? {
            GatewayMessage::NetworkTime {
                flags,
                ntp_seconds,
                ntp_fraction,
                network_time,
            } => {
                let base = if flags & NET_TIME_FLAG_VALID != 0 {
                    let base = TimeBase {
                        network_time,
                        ntp_base: ntp_to_utc(NtpTimestamp {
                            seconds: ntp_seconds,
                            fraction: ntp_fraction,
                        }),
                    };
                    debug!(
                        "time resync network base:{} ntp base:{}",
                        base.network_time, base.ntp_base
                    );
                    Some(base)
                } else {
                    None
                };

                *self.time_base.lock() = base;
                Ok(base)
            }
            other => Err(DeviceError::UnexpectedReply(other.msg_type() as u16)),
        }
    }

    async fn resync(&self) -> Result<TimeBase> {
        match self.network_time().await {
            Ok(Some(base)) => Ok(base),
            Ok(None) => Err(DeviceError::TimeNotSynchronized),
            Err(_) => Err(DeviceError::TimeNotSynchronized),
        }
    }

    /// Translate a device-network microsecond counter into wall-clock
    /// time, resyncing when the base is missing, stale, or the counter
    /// has wrapped past half its range.
    pub async fn convert_network_time(&self, network_time: u32) -> Result<DateTime<Utc>> {
        let mut base = match *self.time_base.lock() {
            Some(base) => base,
            None => self.resync().await?,
        };

        if Utc::now() > base.ntp_base + TimeDelta::seconds(NETWORK_SYNC_VALID_SECS) {
            base = self.resync().await?;
        }

        let mut elapsed = network_time as i64 - base.network_time as i64;
        if elapsed.abs() >= 1 << 31 {
            base = self.resync().await?;
            elapsed = network_time as i64 - base.network_time as i64;
        }

        Ok(base.ntp_base + TimeDelta::microseconds(elapsed))
    }

    #[cfg(test)]
    pub(crate) fn install_time_base(&self, base: Option<TimeBase>) {
        *self.time_base.lock() = base;
    }
}
