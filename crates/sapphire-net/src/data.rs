//! Structured device records
//!
//! The fixed-layout structs devices export through files and KV responses.
//! Arrays of unknown element count unpack to buffer exhaustion, one record
//! per iteration.

use crate::error::Result;
use crate::fields::{
    self, get_i32, get_i8, get_u16, get_u32, get_u64, get_u8, pack_ipv4, pack_mac, pack_string,
    pack_uuid, take, unpack_cstring, unpack_ipv4, unpack_mac, unpack_string, unpack_uuid,
};
use crate::types::{KvValue, WireType};
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Unpack homogeneous records until the buffer is exhausted
pub fn unpack_array<T>(data: &[u8], unpack: impl Fn(&mut &[u8]) -> Result<T>) -> Result<Vec<T>> {
    let mut buf = data;
    let mut out = Vec::new();

    while !buf.is_empty() {
        out.push(unpack(&mut buf)?);
    }

    Ok(out)
}

/// Firmware info block, served as the `fwinfo` file and embedded in images
#[derive(Clone, Debug, PartialEq)]
pub struct FirmwareInfo {
    pub firmware_length: u32,
    pub firmware_id: Uuid,
    pub os_name: String,
    pub os_version: String,
    pub app_name: String,
    pub app_version: String,
}

impl FirmwareInfo {
    pub const SIZE: usize = 4 + 16 + 128 + 16 + 128 + 16;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            firmware_length: get_u32(buf)?,
            firmware_id: unpack_uuid(buf)?,
            os_name: unpack_string(buf, 128)?,
            os_version: unpack_string(buf, 16)?,
            app_name: unpack_string(buf, 128)?,
            app_version: unpack_string(buf, 16)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.firmware_length);
        pack_uuid(dst, &self.firmware_id);
        pack_string(dst, &self.os_name, 128);
        pack_string(dst, &self.os_version, 16);
        pack_string(dst, &self.app_name, 128);
        pack_string(dst, &self.app_version, 16);
    }
}

/// One entry of the `fileinfo` listing
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub filesize: i32,
    pub filename: String,
    pub flags: u8,
}

impl FileInfo {
    pub const SIZE: usize = 4 + 64 + 1 + 15;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let entry = Self {
            filesize: get_i32(buf)?,
            filename: unpack_string(buf, 64)?,
            flags: get_u8(buf)?,
        };
        take(buf, 15)?; // reserved
        Ok(entry)
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.filesize);
        pack_string(dst, &self.filename, 64);
        dst.put_u8(self.flags);
        dst.put_bytes(0, 15);
    }
}

/// One entry of a gateway's `devicedb` file
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDbEntry {
    pub short_addr: u16,
    pub device_id: u64,
    pub ip: Ipv4Addr,
}

impl DeviceDbEntry {
    pub const SIZE: usize = 2 + 8 + 4;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            short_addr: get_u16(buf)?,
            device_id: get_u64(buf)?,
            ip: unpack_ipv4(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.short_addr);
        dst.put_u64_le(self.device_id);
        pack_ipv4(dst, self.ip);
    }
}

/// One entry of the `routes` file
#[derive(Clone, Debug, PartialEq)]
pub struct RouteEntry {
    pub dest_ip: Ipv4Addr,
    pub dest_short: u16,
    pub dest_flags: u8,
    pub cost: u16,
    pub age: u8,
    pub hop_count: u8,
    pub hops: [u16; 8],
}

impl RouteEntry {
    pub const SIZE: usize = 4 + 2 + 1 + 2 + 1 + 1 + 16;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let dest_ip = unpack_ipv4(buf)?;
        let dest_short = get_u16(buf)?;
        let dest_flags = get_u8(buf)?;
        let cost = get_u16(buf)?;
        let age = get_u8(buf)?;
        let hop_count = get_u8(buf)?;

        let mut hops = [0u16; 8];
        for hop in hops.iter_mut() {
            *hop = get_u16(buf)?;
        }

        Ok(Self {
            dest_ip,
            dest_short,
            dest_flags,
            cost,
            age,
            hop_count,
            hops,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        pack_ipv4(dst, self.dest_ip);
        dst.put_u16_le(self.dest_short);
        dst.put_u8(self.dest_flags);
        dst.put_u16_le(self.cost);
        dst.put_u8(self.age);
        dst.put_u8(self.hop_count);
        for hop in self.hops {
            dst.put_u16_le(hop);
        }
    }
}

/// One entry of the `neighbors` file
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborEntry {
    pub flags: u16,
    pub ip: Ipv4Addr,
    pub short_addr: u16,
    pub iv: [u8; 16],
    pub replay_counter: u32,
    pub lqi: u8,
    pub rssi: u8,
    pub prr: u8,
    pub etx: u8,
    pub delay: u8,
    pub traffic_accumulator: u8,
    pub traffic: u8,
    pub age: u8,
}

impl NeighborEntry {
    pub const SIZE: usize = 2 + 4 + 2 + 16 + 4 + 8;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let flags = get_u16(buf)?;
        let ip = unpack_ipv4(buf)?;
        let short_addr = get_u16(buf)?;

        let mut iv = [0u8; 16];
        iv.copy_from_slice(take(buf, 16)?);

        Ok(Self {
            flags,
            ip,
            short_addr,
            iv,
            replay_counter: get_u32(buf)?,
            lqi: get_u8(buf)?,
            rssi: get_u8(buf)?,
            prr: get_u8(buf)?,
            etx: get_u8(buf)?,
            delay: get_u8(buf)?,
            traffic_accumulator: get_u8(buf)?,
            traffic: get_u8(buf)?,
            age: get_u8(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.flags);
        pack_ipv4(dst, self.ip);
        dst.put_u16_le(self.short_addr);
        dst.put_slice(&self.iv);
        dst.put_u32_le(self.replay_counter);
        dst.put_u8(self.lqi);
        dst.put_u8(self.rssi);
        dst.put_u8(self.prr);
        dst.put_u8(self.etx);
        dst.put_u8(self.delay);
        dst.put_u8(self.traffic_accumulator);
        dst.put_u8(self.traffic);
        dst.put_u8(self.age);
    }
}

/// One entry of the `threadinfo` file
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadInfo {
    pub name: String,
    pub flags: u16,
    pub addr: u16,
    pub data_size: u16,
    pub run_time: u32,
    pub runs: u32,
    pub line: u16,
}

impl ThreadInfo {
    pub const SIZE: usize = 64 + 2 + 2 + 2 + 4 + 4 + 2 + 32;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let entry = Self {
            name: unpack_string(buf, 64)?,
            flags: get_u16(buf)?,
            addr: get_u16(buf)?,
            data_size: get_u16(buf)?,
            run_time: get_u32(buf)?,
            runs: get_u32(buf)?,
            line: get_u16(buf)?,
        };
        take(buf, 32)?; // reserved
        Ok(entry)
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        pack_string(dst, &self.name, 64);
        dst.put_u16_le(self.flags);
        dst.put_u16_le(self.addr);
        dst.put_u16_le(self.data_size);
        dst.put_u32_le(self.run_time);
        dst.put_u32_le(self.runs);
        dst.put_u16_le(self.line);
        dst.put_bytes(0, 32);
    }
}

/// One entry of the `dns_cache` file; the query string is NUL-terminated
/// so entries are variably sized.
#[derive(Clone, Debug, PartialEq)]
pub struct DnsCacheEntry {
    pub status: u8,
    pub ip: Ipv4Addr,
    pub ttl: u32,
    pub query: String,
}

impl DnsCacheEntry {
    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            status: get_u8(buf)?,
            ip: unpack_ipv4(buf)?,
            ttl: get_u32(buf)?,
            query: unpack_cstring(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u8(self.status);
        pack_ipv4(dst, self.ip);
        dst.put_u32_le(self.ttl);
        dst.put_slice(self.query.as_bytes());
        dst.put_u8(0);
    }
}

/// One entry of a gateway's `bridge` file
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeEntry {
    pub short_addr: u16,
    pub ip: Ipv4Addr,
    pub lease: u32,
    pub time_left: u32,
    pub flags: u8,
}

impl BridgeEntry {
    pub const SIZE: usize = 2 + 4 + 4 + 4 + 1;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            short_addr: get_u16(buf)?,
            ip: unpack_ipv4(buf)?,
            lease: get_u32(buf)?,
            time_left: get_u32(buf)?,
            flags: get_u8(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.short_addr);
        pack_ipv4(dst, self.ip);
        dst.put_u32_le(self.lease);
        dst.put_u32_le(self.time_left);
        dst.put_u8(self.flags);
    }
}

/// One entry of a gateway's `arp_cache` file
#[derive(Clone, Debug, PartialEq)]
pub struct ArpEntry {
    pub eth_mac: String,
    pub ip: Ipv4Addr,
    pub age: u8,
}

impl ArpEntry {
    pub const SIZE: usize = 6 + 4 + 1;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            eth_mac: unpack_mac(buf, fields::MAC48_LEN)?,
            ip: unpack_ipv4(buf)?,
            age: get_u8(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) -> Result<()> {
        pack_mac(dst, &self.eth_mac, fields::MAC48_LEN)?;
        pack_ipv4(dst, self.ip);
        dst.put_u8(self.age);
        Ok(())
    }
}

/// 64-bit NTP timestamp as devices stamp notifications
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const SIZE: usize = 8;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            seconds: get_u32(buf)?,
            fraction: get_u32(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.seconds);
        dst.put_u32_le(self.fraction);
    }

    /// Fractional seconds since the NTP epoch (1900-01-01)
    pub fn as_seconds(&self) -> f64 {
        self.seconds as f64 + self.fraction as f64 / 2f64.powi(32)
    }
}

/// Serial frame header: length and its complement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SerialFrameHeader {
    pub len: u16,
    pub inverted_len: u16,
}

impl SerialFrameHeader {
    pub const SIZE: usize = 4;

    pub fn for_len(len: u16) -> Self {
        Self {
            len,
            inverted_len: !len,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.len == !self.inverted_len
    }

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            len: get_u16(buf)?,
            inverted_len: get_u16(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.len);
        dst.put_u16_le(self.inverted_len);
    }
}

/// One KV metadata record from the `kvmeta` file. The two pointer words are
/// device-internal and carried only as padding.
#[derive(Clone, Debug, PartialEq)]
pub struct KvMetaEntry {
    pub group: u8,
    pub id: u8,
    pub ty: WireType,
    pub flags: u16,
    pub param_name: String,
}

impl KvMetaEntry {
    pub const SIZE: usize = 1 + 1 + 1 + 2 + 2 + 2 + 32;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let group = get_u8(buf)?;
        let id = get_u8(buf)?;
        let ty = WireType::from_wire(get_i8(buf)?)?;
        let flags = get_u16(buf)?;
        take(buf, 4)?; // var/notifier pointers
        let param_name = unpack_string(buf, 32)?;

        Ok(Self {
            group,
            id,
            ty,
            flags,
            param_name,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u8(self.group);
        dst.put_u8(self.id);
        dst.put_i8(self.ty.code());
        dst.put_u16_le(self.flags);
        dst.put_bytes(0, 4);
        pack_string(dst, &self.param_name, 32);
    }
}

/// A typed parameter value as carried in SetKV commands and GetKV responses
#[derive(Clone, Debug, PartialEq)]
pub struct KvParam {
    pub group: u8,
    pub id: u8,
    pub ty: WireType,
    pub value: KvValue,
}

impl KvParam {
    pub fn size(&self) -> usize {
        3 + self.ty.size()
    }

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        let group = get_u8(buf)?;
        let id = get_u8(buf)?;
        let ty = WireType::from_wire(get_i8(buf)?)?;
        let value = ty.decode(buf)?;

        Ok(Self {
            group,
            id,
            ty,
            value,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.group);
        dst.put_u8(self.id);
        dst.put_i8(self.ty.code());
        self.ty.encode(&self.value, dst)
    }
}

/// A typed read request; the response it provokes is a `KvParam`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KvRequest {
    pub group: u8,
    pub id: u8,
    pub ty: WireType,
}

impl KvRequest {
    pub const SIZE: usize = 3;

    /// On-wire size of the parameter this request returns
    pub fn response_size(&self) -> usize {
        Self::SIZE + self.ty.size()
    }

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            group: get_u8(buf)?,
            id: get_u8(buf)?,
            ty: WireType::from_wire(get_i8(buf)?)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u8(self.group);
        dst.put_u8(self.id);
        dst.put_i8(self.ty.code());
    }
}

/// Per-parameter status in a SetKV response
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KvStatus {
    pub group: u8,
    pub id: u8,
    pub status: i8,
}

impl KvStatus {
    pub const SIZE: usize = 3;

    pub fn unpack(buf: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            group: get_u8(buf)?,
            id: get_u8(buf)?,
            status: get_i8(buf)?,
        })
    }

    pub fn pack(&self, dst: &mut BytesMut) {
        dst.put_u8(self.group);
        dst.put_u8(self.id);
        dst.put_i8(self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_info_roundtrip() {
        let info = FirmwareInfo {
            firmware_length: 0x12345,
            firmware_id: Uuid::new_v4(),
            os_name: "sapphire os".into(),
            os_version: "1.2".into(),
            app_name: "controller".into(),
            app_version: "0.9".into(),
        };

        let mut dst = BytesMut::new();
        info.pack(&mut dst);
        assert_eq!(dst.len(), FirmwareInfo::SIZE);

        let mut buf = &dst[..];
        assert_eq!(FirmwareInfo::unpack(&mut buf).unwrap(), info);
    }

    #[test]
    fn test_device_db_array() {
        let entries = vec![
            DeviceDbEntry {
                short_addr: 1,
                device_id: 0xdead_beef,
                ip: "10.0.0.1".parse().unwrap(),
            },
            DeviceDbEntry {
                short_addr: 2,
                device_id: 0xcafe,
                ip: "10.0.0.2".parse().unwrap(),
            },
        ];

        let mut dst = BytesMut::new();
        for e in &entries {
            e.pack(&mut dst);
        }

        let decoded = unpack_array(&dst, DeviceDbEntry::unpack).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_route_entry_size() {
        let entry = RouteEntry {
            dest_ip: "10.1.0.3".parse().unwrap(),
            dest_short: 3,
            dest_flags: 0,
            cost: 120,
            age: 4,
            hop_count: 2,
            hops: [5, 9, 0, 0, 0, 0, 0, 0],
        };

        let mut dst = BytesMut::new();
        entry.pack(&mut dst);
        assert_eq!(dst.len(), RouteEntry::SIZE);

        let mut buf = &dst[..];
        assert_eq!(RouteEntry::unpack(&mut buf).unwrap(), entry);
    }

    #[test]
    fn test_dns_cache_variable_length() {
        let entries = vec![
            DnsCacheEntry {
                status: 1,
                ip: "8.8.8.8".parse().unwrap(),
                ttl: 300,
                query: "example.com".into(),
            },
            DnsCacheEntry {
                status: 2,
                ip: "0.0.0.0".parse().unwrap(),
                ttl: 0,
                query: "x".into(),
            },
        ];

        let mut dst = BytesMut::new();
        for e in &entries {
            e.pack(&mut dst);
        }

        let decoded = unpack_array(&dst, DnsCacheEntry::unpack).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_kv_meta_entry() {
        let entry = KvMetaEntry {
            group: 2,
            id: 7,
            ty: WireType::Uint32,
            flags: 0x0001,
            param_name: "sys_time".into(),
        };

        let mut dst = BytesMut::new();
        entry.pack(&mut dst);
        assert_eq!(dst.len(), KvMetaEntry::SIZE);

        let mut buf = &dst[..];
        assert_eq!(KvMetaEntry::unpack(&mut buf).unwrap(), entry);
    }

    #[test]
    fn test_kv_param_sizes() {
        let param = KvParam {
            group: 2,
            id: 1,
            ty: WireType::Uint32,
            value: KvValue::Uint(1000),
        };
        assert_eq!(param.size(), 7);

        let mut dst = BytesMut::new();
        param.pack(&mut dst).unwrap();
        assert_eq!(dst.len(), 7);

        let mut buf = &dst[..];
        assert_eq!(KvParam::unpack(&mut buf).unwrap(), param);

        let request = KvRequest {
            group: 2,
            id: 1,
            ty: WireType::Uint32,
        };
        assert_eq!(request.response_size(), 7);
    }

    #[test]
    fn test_thread_info_roundtrip() {
        let entry = ThreadInfo {
            name: "netmsg".into(),
            flags: 3,
            addr: 0x1000,
            data_size: 64,
            run_time: 123456,
            runs: 99,
            line: 42,
        };

        let mut dst = BytesMut::new();
        entry.pack(&mut dst);
        assert_eq!(dst.len(), ThreadInfo::SIZE);

        let mut buf = &dst[..];
        assert_eq!(ThreadInfo::unpack(&mut buf).unwrap(), entry);
    }

    #[test]
    fn test_ntp_timestamp() {
        let ts = NtpTimestamp {
            seconds: 10,
            fraction: 1 << 31,
        };
        assert!((ts.as_seconds() - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_serial_header_consistency() {
        let header = SerialFrameHeader::for_len(300);
        assert!(header.is_consistent());

        let bad = SerialFrameHeader {
            len: 300,
            inverted_len: 0,
        };
        assert!(!bad.is_consistent());
    }
}
