//! Device sessions
//!
//! A `Device` pairs the replicated exchange object for one physical device
//! with its communication channel and KV metadata. All command traffic is
//! serialized through the channel lock so exactly one request/ack exchange
//! is outstanding per device, which is what makes the random-id ARQ safe.

use crate::error::{DeviceError, Result};
use crate::firmware::FirmwareStore;
use crate::kvmeta::KvMeta;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use sapphire_core::{Exchange, KvObject, Store};
use sapphire_net::channel::Channel;
use sapphire_net::data::{
    unpack_array, DnsCacheEntry, FileInfo, FirmwareInfo, KvParam, KvRequest, NeighborEntry,
    NtpTimestamp, RouteEntry, ThreadInfo,
};
use sapphire_net::fields::get_u32;
use sapphire_net::protocol::{DeviceCommand, DeviceReply, Notification};
use sapphire_net::types::{KvValue, WireType};
use sapphire_net::udpx::SocketPool;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// File transfers move in chunks of this many bytes; a shorter chunk ends
/// the file.
pub const FILE_TRANSFER_LEN: usize = 512;

/// KV batches never exceed this many payload bytes on the wire
pub const MAX_KV_DATA_LEN: usize = 548;

/// Devices delay this long after a reboot command before dropping off
const REBOOT_DELAY: Duration = Duration::from_secs(1);

/// Offset from the NTP epoch (1900) to the Unix epoch (1970)
const NTP_UNIX_DELTA: i64 = 2_208_988_800;

// System warning flags
pub const SYS_WARN_MEM_FULL: u32 = 0x0001;
pub const SYS_WARN_NETMSG_FULL: u32 = 0x0002;
pub const SYS_WARN_FLASHFS_FAIL: u32 = 0x0004;
pub const SYS_WARN_FLASHFS_HARD_ERROR: u32 = 0x0008;
pub const SYS_WARN_CONFIG_FULL: u32 = 0x0010;
pub const SYS_WARN_CONFIG_WRITE_FAIL: u32 = 0x0020;

/// Decode the `sys_warnings` bitmask into warning names
pub fn decode_warnings(flags: u32) -> Vec<&'static str> {
    let table = [
        (SYS_WARN_MEM_FULL, "mem_full"),
        (SYS_WARN_NETMSG_FULL, "netmsg_full"),
        (SYS_WARN_FLASHFS_FAIL, "flashfs_fail"),
        (SYS_WARN_FLASHFS_HARD_ERROR, "flashfs_hard_error"),
        (SYS_WARN_CONFIG_FULL, "config_full"),
        (SYS_WARN_CONFIG_WRITE_FAIL, "config_write_fail"),
    ];

    table
        .iter()
        .filter(|(flag, _)| flags & flag != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Convert a device NTP timestamp to wall-clock time
pub fn ntp_to_utc(ts: NtpTimestamp) -> DateTime<Utc> {
    let nanos = (ts.fraction as f64 / 2f64.powi(32) * 1e9) as u32;
    DateTime::from_timestamp(ts.seconds as i64 - NTP_UNIX_DELTA, nanos)
        .unwrap_or_else(Utc::now)
}

fn ntp_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(-NTP_UNIX_DELTA, 0).unwrap_or_else(Utc::now)
}

/// Supervisory state of a device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Unknown,
    Offline,
    Online,
    Reboot,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Reboot => "reboot",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "offline" => Self::Offline,
            "online" => Self::Online,
            "reboot" => Self::Reboot,
            _ => Self::Unknown,
        }
    }
}

pub struct Device {
    device_id: u64,
    object: Arc<KvObject>,
    exchange: Exchange,
    store: Arc<Store>,
    meta: SyncMutex<KvMeta>,
    channel: Mutex<Channel>,
    firmware_hash: SyncMutex<Option<String>>,
    last_notification: SyncMutex<DateTime<Utc>>,
}

impl Device {
    /// Create the session and its exchange object. The object is not
    /// published here; the scanner publishes devices it has not seen.
    pub fn new(
        exchange: &Exchange,
        store: &Arc<Store>,
        pool: &SocketPool,
        host: &str,
        command_port: u16,
        short_addr: u16,
        device_id: u64,
    ) -> Result<Arc<Self>> {
        let channel = Channel::connect(host, command_port, pool)?;

        let object = KvObject::with_id(exchange.origin(), device_id.to_string(), Some("devices"));
        object.set("device_id", device_id)?;
        object.set("short_addr", short_addr)?;
        object.set("host", host)?;
        object.set("name", format!("<anon@{}>", short_addr))?;
        object.set("firmware_id", "")?;
        object.set("firmware_name", "")?;
        object.set("firmware_version", "")?;
        object.set("os_name", "")?;
        object.set("os_version", "")?;
        object.set("device_status", DeviceStatus::Offline.as_str())?;

        Ok(Arc::new(Self {
            device_id,
            object,
            exchange: exchange.clone(),
            store: store.clone(),
            meta: SyncMutex::new(KvMeta::new()),
            channel: Mutex::new(channel),
            firmware_hash: SyncMutex::new(None),
            last_notification: SyncMutex::new(ntp_epoch()),
        }))
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn object(&self) -> &Arc<KvObject> {
        &self.object
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn host(&self) -> String {
        self.object
            .get("host")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.object
            .get("name")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn status(&self) -> DeviceStatus {
        self.object
            .get("device_status")
            .and_then(|v| v.as_str().map(DeviceStatus::from_str))
            .unwrap_or(DeviceStatus::Unknown)
    }

    pub fn set_status(&self, status: DeviceStatus) {
        debug!("device {} -> {}", self.device_id, status.as_str());
        let _ = self.object.set("device_status", status.as_str());
    }

    pub fn last_notification_at(&self) -> DateTime<Utc> {
        *self.last_notification.lock()
    }

    pub fn touch_notification(&self) {
        *self.last_notification.lock() = Utc::now();
    }

    /// True when the device exports a parameter of this name
    pub fn has_param(&self, key: &str) -> bool {
        self.meta.lock().get(key).is_some()
    }

    pub fn param_names(&self) -> Vec<String> {
        self.meta.lock().keys()
    }

    /// Shrink the retry ladder; used where long stalls are unacceptable
    pub async fn set_timeout(&self, timeout: Duration) {
        self.channel.lock().await.set_timeout(timeout);
    }

    /// One serialized command round-trip. Channel failures flip the device
    /// offline; a successful exchange flips it online.
    async fn send_command(&self, command: DeviceCommand) -> Result<DeviceReply> {
        let packed = command.pack()?;

        let mut channel = self.channel.lock().await;
        match channel.exchange(&packed).await {
            Ok(data) => {
                drop(channel);

                if self.status() != DeviceStatus::Online {
                    self.set_status(DeviceStatus::Online);
                }

                Ok(DeviceReply::unpack(&data)?)
            }
            Err(e) => {
                drop(channel);

                if self.status() == DeviceStatus::Online {
                    self.set_status(DeviceStatus::Offline);
                }

                Err(DeviceError::Unreachable(format!(
                    "device {}: {}",
                    self.device_id, e
                )))
            }
        }
    }

    pub async fn echo(&self, data: &str) -> Result<String> {
        match self
            .send_command(DeviceCommand::Echo {
                echo_data: data.to_string(),
            })
            .await?
        {
            DeviceReply::Echo { echo_data } => Ok(echo_data),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    /// Refresh firmware info, KV metadata, and the core attributes
    pub async fn scan(&self) -> Result<()> {
        self.firmware_info().await?;
        self.load_kv_meta().await?;
        self.get_kv(&["name", "short_addr"]).await?;
        Ok(())
    }

    /// Fetch the `fwinfo` block and refresh the firmware attributes. The
    /// blob's hash keys the KV metadata cache.
    pub async fn firmware_info(&self) -> Result<FirmwareInfo> {
        let data = self.get_file("fwinfo").await?;

        *self.firmware_hash.lock() = Some(hex::encode(Sha256::digest(&data)));

        let info = FirmwareInfo::unpack(&mut &data[..])?;

        self.object
            .set("firmware_id", info.firmware_id.to_string())?;
        self.object.set("firmware_name", info.app_name.clone())?;
        self.object
            .set("firmware_version", info.app_version.clone())?;
        self.object.set("os_name", info.os_name.clone())?;
        self.object.set("os_version", info.os_version.clone())?;

        Ok(info)
    }

    /// Load the KV metadata table, going to the device only when the cache
    /// has never seen this firmware image.
    pub async fn load_kv_meta(&self) -> Result<()> {
        if self.firmware_hash.lock().is_none() {
            self.firmware_info().await?;
        }

        let hash = self
            .firmware_hash
            .lock()
            .clone()
            .unwrap_or_default();
        let cache_key = format!("kv_meta:{}", hash);

        let cached = self
            .store
            .get(&cache_key)?
            .and_then(|v| v.get("kv_meta").and_then(Value::as_str).map(str::to_string))
            .and_then(|h| hex::decode(h).ok());

        let data = match cached {
            Some(data) => data,
            None => {
                let data = self.get_file("kvmeta").await?;
                self.store.put(
                    &cache_key,
                    &serde_json::json!({ "kv_meta": hex::encode(&data) }),
                )?;
                data
            }
        };

        let entries = unpack_array(&data, sapphire_net::data::KvMetaEntry::unpack)?;
        *self.meta.lock() = KvMeta::from_entries(entries)?;

        Ok(())
    }

    /// Read parameters by name. Requests are packed greedily into batches
    /// whose response size stays inside one datagram; responses are
    /// de-batched by (group, id).
    pub async fn get_kv(&self, names: &[&str]) -> Result<HashMap<String, Value>> {
        let mut requests = Vec::with_capacity(names.len());
        let mut keys: HashMap<(u8, u8), String> = HashMap::new();

        {
            let meta = self.meta.lock();
            for name in names {
                let key = meta
                    .get(name)
                    .ok_or_else(|| DeviceError::UnknownKey(name.to_string()))?;
                requests.push(KvRequest {
                    group: key.group,
                    id: key.id,
                    ty: key.ty,
                });
                keys.insert((key.group, key.id), key.key.clone());
            }
        }

        let mut responses = HashMap::new();

        for batch in batch_requests(requests) {
            let reply = self
                .send_command(DeviceCommand::GetKv { requests: batch })
                .await?;

            let params = match reply {
                DeviceReply::GetKv { params } => params,
                other => return Err(DeviceError::UnexpectedReply(other.msg_type())),
            };

            for param in params {
                let key = keys
                    .get(&(param.group, param.id))
                    .ok_or_else(|| {
                        DeviceError::UnknownKey(format!(
                            "group {} id {}",
                            param.group, param.id
                        ))
                    })?
                    .clone();

                let value = param.value.to_json();

                if let Some(entry) = self.meta.lock().get_mut(&key) {
                    entry.value = Some(value.clone());
                }

                // the device id attribute anchors the object id; never
                // overwrite it from a response
                if key != "device_id" {
                    self.object.set(&key, value.clone())?;
                }

                responses.insert(key, value);
            }
        }

        Ok(responses)
    }

    pub async fn get_key(&self, name: &str) -> Result<Value> {
        let mut responses = self.get_kv(&[name]).await?;
        responses
            .remove(name)
            .ok_or_else(|| DeviceError::UnknownKey(name.to_string()))
    }

    /// Read every parameter the device exports
    pub async fn get_all_kv(&self) -> Result<HashMap<String, Value>> {
        let names = self.meta.lock().keys();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.get_kv(&refs).await
    }

    /// Write parameters by name, batched the same way reads are
    pub async fn set_kv(&self, updates: &[(&str, Value)]) -> Result<()> {
        let mut params = Vec::with_capacity(updates.len());
        let mut keys: HashMap<(u8, u8), (String, Value)> = HashMap::new();

        {
            let meta = self.meta.lock();
            for (name, value) in updates {
                let key = meta
                    .get(name)
                    .ok_or_else(|| DeviceError::UnknownKey(name.to_string()))?;

                if key.is_read_only() {
                    return Err(DeviceError::ReadOnlyKey(name.to_string()));
                }

                params.push(KvParam {
                    group: key.group,
                    id: key.id,
                    ty: key.ty,
                    value: KvValue::from_json(key.ty, value)?,
                });
                keys.insert((key.group, key.id), (key.key.clone(), value.clone()));
            }
        }

        for batch in batch_params(params) {
            let reply = self
                .send_command(DeviceCommand::SetKv { params: batch })
                .await?;

            let statuses = match reply {
                DeviceReply::SetKv { statuses } => statuses,
                other => return Err(DeviceError::UnexpectedReply(other.msg_type())),
            };

            for status in statuses {
                let (key, value) = keys
                    .get(&(status.group, status.id))
                    .ok_or_else(|| {
                        DeviceError::UnknownKey(format!(
                            "group {} id {}",
                            status.group, status.id
                        ))
                    })?
                    .clone();

                if status.status < 0 {
                    return Err(DeviceError::SetRejected {
                        key,
                        status: status.status,
                    });
                }

                if let Some(entry) = self.meta.lock().get_mut(&key) {
                    entry.value = Some(value.clone());
                }
                self.object.update(&key, value, None);
            }
        }

        Ok(())
    }

    pub async fn set_key(&self, name: &str, value: Value) -> Result<()> {
        self.set_kv(&[(name, value)]).await
    }

    fn check_file_id(&self, name: &str, file_id: i8) -> Result<u8> {
        if file_id < 0 {
            return Err(DeviceError::File(format!("file {} not found", name)));
        }
        Ok(file_id as u8)
    }

    pub async fn file_id(&self, name: &str) -> Result<u8> {
        match self
            .send_command(DeviceCommand::GetFileId {
                name: name.to_string(),
            })
            .await?
        {
            DeviceReply::GetFileId { file_id } => self.check_file_id(name, file_id),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    pub async fn create_file(&self, name: &str) -> Result<u8> {
        match self
            .send_command(DeviceCommand::CreateFile {
                name: name.to_string(),
            })
            .await?
        {
            DeviceReply::CreateFile { file_id } => self.check_file_id(name, file_id),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    async fn read_file_chunk(&self, file_id: u8, position: u32, length: u32) -> Result<Vec<u8>> {
        match self
            .send_command(DeviceCommand::ReadFileData {
                file_id,
                position,
                length,
            })
            .await?
        {
            DeviceReply::ReadFileData { data } => Ok(data),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    async fn write_file_chunk(&self, file_id: u8, position: u32, data: &[u8]) -> Result<u16> {
        match self
            .send_command(DeviceCommand::WriteFileData {
                file_id,
                position,
                length: data.len() as u32,
                data: data.to_vec(),
            })
            .await?
        {
            DeviceReply::WriteFileData { write_length } => Ok(write_length),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    pub async fn remove_file(&self, file_id: u8) -> Result<()> {
        match self
            .send_command(DeviceCommand::RemoveFile { file_id })
            .await?
        {
            DeviceReply::RemoveFile { status } if status < 0 => {
                Err(DeviceError::File(format!("file {} not deleted", file_id)))
            }
            DeviceReply::RemoveFile { .. } => Ok(()),
            other => Err(DeviceError::UnexpectedReply(other.msg_type())),
        }
    }

    /// Read a whole file; the transfer ends on the first short chunk
    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>> {
        let file_id = self.file_id(name).await?;

        let mut data = Vec::new();
        let mut position = 0u32;

        loop {
            let chunk = self
                .read_file_chunk(file_id, position, FILE_TRANSFER_LEN as u32)
                .await?;
            let len = chunk.len();
            data.extend_from_slice(&chunk);

            if len < FILE_TRANSFER_LEN {
                break;
            }

            position += FILE_TRANSFER_LEN as u32;
        }

        Ok(data)
    }

    /// Write a whole file, creating it if needed; a short write aborts
    pub async fn put_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let file_id = match self.file_id(name).await {
            Ok(id) => id,
            Err(DeviceError::File(_)) => self.create_file(name).await?,
            Err(e) => return Err(e),
        };

        let mut position = 0usize;

        while position < data.len() {
            let chunk = &data[position..(position + FILE_TRANSFER_LEN).min(data.len())];

            let written = self
                .write_file_chunk(file_id, position as u32, chunk)
                .await?;
            if (written as usize) < chunk.len() {
                return Err(DeviceError::File(format!(
                    "short write on {}: {} of {} bytes",
                    name,
                    written,
                    chunk.len()
                )));
            }

            position += FILE_TRANSFER_LEN;
        }

        Ok(())
    }

    pub async fn list_files(&self) -> Result<Vec<FileInfo>> {
        let data = self.get_file("fileinfo").await?;
        Ok(unpack_array(&data, FileInfo::unpack)?)
    }

    /// Issue a reboot-class command and walk the status machine through
    /// its one-second dwell.
    async fn reboot_command(&self, command: DeviceCommand) -> Result<()> {
        self.send_command(command).await?;
        self.set_status(DeviceStatus::Reboot);

        // the device lingers before dropping off the network
        tokio::time::sleep(REBOOT_DELAY).await;
        self.set_status(DeviceStatus::Offline);

        Ok(())
    }

    pub async fn reboot(&self) -> Result<()> {
        self.reboot_command(DeviceCommand::Reboot).await
    }

    pub async fn safe_mode(&self) -> Result<()> {
        self.reboot_command(DeviceCommand::SafeMode).await
    }

    pub async fn reboot_and_load_firmware(&self) -> Result<()> {
        self.reboot_command(DeviceCommand::LoadFirmware).await
    }

    pub async fn format_fs(&self) -> Result<()> {
        self.send_command(DeviceCommand::FormatFs).await?;
        Ok(())
    }

    pub async fn reset_config(&self) -> Result<()> {
        self.send_command(DeviceCommand::ResetCfg).await?;
        Ok(())
    }

    pub async fn reset_time_sync(&self) -> Result<()> {
        self.send_command(DeviceCommand::ResetTimeSync).await?;
        Ok(())
    }

    pub async fn request_route(&self, dest_ip: Ipv4Addr, dest_short: u16) -> Result<()> {
        self.send_command(DeviceCommand::RequestRoute {
            dest_ip,
            dest_short,
            dest_flags: 0,
        })
        .await?;
        Ok(())
    }

    /// Point the device's notification stream at a server. The zero
    /// address means "the sender of this command".
    pub async fn set_kv_server(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        self.send_command(DeviceCommand::SetKvServer { ip, port })
            .await?;
        Ok(())
    }

    pub async fn set_security_key(&self, key_id: u8, key: &str) -> Result<()> {
        self.send_command(DeviceCommand::SetSecurityKey {
            key_id,
            key: key.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Replace the device's firmware image and reboot into the loader
    pub async fn load_firmware(
        &self,
        firmware_id: Option<&str>,
        images: &FirmwareStore,
    ) -> Result<()> {
        let image = match firmware_id {
            Some(id) => images.load_image(id)?,
            None => {
                let info = self.firmware_info().await?;
                images.load_image(&info.firmware_id.to_string())?
            }
        };

        let file_id = self.file_id("firmware.bin").await?;
        self.remove_file(file_id).await?;

        self.put_file("firmware.bin", &image.data).await?;
        self.reboot_and_load_firmware().await
    }

    pub async fn route_info(&self) -> Result<Vec<RouteEntry>> {
        let data = self.get_file("routes").await?;
        Ok(unpack_array(&data, RouteEntry::unpack)?)
    }

    pub async fn neighbor_info(&self) -> Result<Vec<NeighborEntry>> {
        let data = self.get_file("neighbors").await?;
        Ok(unpack_array(&data, NeighborEntry::unpack)?)
    }

    pub async fn dns_info(&self) -> Result<Vec<DnsCacheEntry>> {
        let data = self.get_file("dns_cache").await?;
        Ok(unpack_array(&data, DnsCacheEntry::unpack)?)
    }

    pub async fn thread_info(&self) -> Result<Vec<ThreadInfo>> {
        let data = self.get_file("threadinfo").await?;
        Ok(unpack_array(&data, ThreadInfo::unpack)?)
    }

    /// Flash sector erase counters
    pub async fn gc_info(&self) -> Result<Vec<u32>> {
        let data = self.get_file("gc_data").await?;
        Ok(unpack_array(&data, |buf| Ok(get_u32(buf)?))?)
    }

    /// Apply an unsolicited notification pushed by the device. A value
    /// whose declared type disagrees with the cached metadata is dropped
    /// without decoding.
    pub fn receive_notification(&self, msg: &Notification) -> Result<()> {
        if msg.device_id != self.device_id {
            return Ok(());
        }

        let key = self.meta.lock().translate(msg.group, msg.id)?;

        if let Some(expected) = self.meta.lock().get(&key).map(|k| k.ty) {
            if expected.code() != msg.data_type {
                debug!(
                    "device {} notification type mismatch on {}: {} != {}",
                    self.device_id,
                    key,
                    msg.data_type,
                    expected.code()
                );
                return Ok(());
            }
        }

        let ty = WireType::from_wire(msg.data_type)?;
        let value = ty.decode(&mut &msg.data[..])?.to_json();

        if let Some(entry) = self.meta.lock().get_mut(&key) {
            entry.value = Some(value.clone());
        }

        self.object
            .set_at(&key, value, ntp_to_utc(msg.timestamp))?;

        self.touch_notification();

        if key == "boot_mode" {
            self.set_status(DeviceStatus::Offline);
        } else if self.status() != DeviceStatus::Online {
            self.set_status(DeviceStatus::Online);
        }

        // push the buffered attribute events out to the exchange
        self.exchange.publish(&self.object);

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn install_meta(&self, meta: KvMeta) {
        *self.meta.lock() = meta;
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device:{}", self.device_id)
    }
}

/// Greedily fill read batches so each response fits one datagram
fn batch_requests(requests: Vec<KvRequest>) -> Vec<Vec<KvRequest>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0usize;

    for request in requests {
        let response_size = request.response_size();

        if !current.is_empty() && size + response_size >= MAX_KV_DATA_LEN {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }

        size += response_size;
        current.push(request);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// Greedily fill write batches by request size
fn batch_params(params: Vec<KvParam>) -> Vec<Vec<KvParam>> {
    let mut batches = Vec::new();
    let mut current: Vec<KvParam> = Vec::new();
    let mut size = 0usize;

    for param in params {
        let param_size = param.size();

        if !current.is_empty() && size + param_size >= MAX_KV_DATA_LEN {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }

        size += param_size;
        current.push(param);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}
