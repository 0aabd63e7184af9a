//! Message protocols
//!
//! Three registries of type-tagged payloads. Serialization prepends the
//! message-type scalar (u8 for gateway services and notifications, u16
//! little-endian for device commands); deserialization peeks the type and
//! unpacks the remainder. A type missing from the registry is a hard
//! decode error.

use crate::data::{KvParam, KvRequest, KvStatus, NtpTimestamp, unpack_array};
use crate::error::{NetError, Result};
use crate::fields::{
    get_i8, get_u16, get_u32, get_u64, get_u8, pack_ipv4, pack_key128, pack_string, unpack_ipv4,
    unpack_key128, unpack_string,
};
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

/// UDP port for UDPX-framed device commands
pub const DEVICE_COMMAND_PORT: u16 = 16385;

/// UDP port for plain broadcast gateway discovery
pub const GATEWAY_SERVICES_PORT: u16 = 25002;

/// UDP port for UDPX-framed gateway services (network time)
pub const GATEWAY_SERVICES_UDPX_PORT: u16 = 25003;

/// UDP port the notification server listens on
pub const NOTIFICATION_SERVER_PORT: u16 = 59999;

/// Gateway discovery and network-time services
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayMessage {
    PollGateway {
        short_addr: u16,
    },
    GatewayToken {
        token: u32,
        short_addr: u16,
        device_id: u64,
    },
    GetNetworkTime,
    NetworkTime {
        flags: u8,
        ntp_seconds: u32,
        ntp_fraction: u32,
        network_time: u32,
    },
}

impl GatewayMessage {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::PollGateway { .. } => 1,
            Self::GatewayToken { .. } => 2,
            Self::GetNetworkTime => 9,
            Self::NetworkTime { .. } => 10,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut dst = BytesMut::new();
        dst.put_u8(self.msg_type());

        match self {
            Self::PollGateway { short_addr } => dst.put_u16_le(*short_addr),
            Self::GatewayToken {
                token,
                short_addr,
                device_id,
            } => {
                dst.put_u32_le(*token);
                dst.put_u16_le(*short_addr);
                dst.put_u64_le(*device_id);
            }
            Self::GetNetworkTime => {}
            Self::NetworkTime {
                flags,
                ntp_seconds,
                ntp_fraction,
                network_time,
            } => {
                dst.put_u8(*flags);
                dst.put_u32_le(*ntp_seconds);
                dst.put_u32_le(*ntp_fraction);
                dst.put_u32_le(*network_time);
            }
        }

        dst.to_vec()
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let msg_type = get_u8(&mut buf)?;

        Ok(match msg_type {
            1 => Self::PollGateway {
                short_addr: get_u16(&mut buf)?,
            },
            2 => Self::GatewayToken {
                token: get_u32(&mut buf)?,
                short_addr: get_u16(&mut buf)?,
                device_id: get_u64(&mut buf)?,
            },
            9 => Self::GetNetworkTime,
            10 => Self::NetworkTime {
                flags: get_u8(&mut buf)?,
                ntp_seconds: get_u32(&mut buf)?,
                ntp_fraction: get_u32(&mut buf)?,
                network_time: get_u32(&mut buf)?,
            },
            other => return Err(NetError::UnknownMessageType(other as u16)),
        })
    }
}

/// Commands accepted by every device on the command port
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    Echo {
        echo_data: String,
    },
    Reboot,
    SafeMode,
    LoadFirmware,
    FormatFs,
    GetFileId {
        name: String,
    },
    CreateFile {
        name: String,
    },
    ReadFileData {
        file_id: u8,
        position: u32,
        length: u32,
    },
    WriteFileData {
        file_id: u8,
        position: u32,
        length: u32,
        data: Vec<u8>,
    },
    RemoveFile {
        file_id: u8,
    },
    ResetCfg,
    RequestRoute {
        dest_ip: Ipv4Addr,
        dest_short: u16,
        dest_flags: u8,
    },
    ResetTimeSync,
    SetKv {
        params: Vec<KvParam>,
    },
    GetKv {
        requests: Vec<KvRequest>,
    },
    SetKvServer {
        ip: Ipv4Addr,
        port: u16,
    },
    SetSecurityKey {
        key_id: u8,
        key: String,
    },
}

impl DeviceCommand {
    pub fn msg_type(&self) -> u16 {
        match self {
            Self::Echo { .. } => 1,
            Self::Reboot => 2,
            Self::SafeMode => 3,
            Self::LoadFirmware => 4,
            Self::FormatFs => 10,
            Self::GetFileId { .. } => 20,
            Self::CreateFile { .. } => 21,
            Self::ReadFileData { .. } => 22,
            Self::WriteFileData { .. } => 23,
            Self::RemoveFile { .. } => 24,
            Self::ResetCfg => 32,
            Self::RequestRoute { .. } => 50,
            Self::ResetTimeSync => 70,
            Self::SetKv { .. } => 80,
            Self::GetKv { .. } => 81,
            Self::SetKvServer { .. } => 85,
            Self::SetSecurityKey { .. } => 90,
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut dst = BytesMut::new();
        dst.put_u16_le(self.msg_type());

        match self {
            Self::Echo { echo_data } => pack_string(&mut dst, echo_data, 128),
            Self::Reboot
            | Self::SafeMode
            | Self::LoadFirmware
            | Self::FormatFs
            | Self::ResetCfg
            | Self::ResetTimeSync => {}
            Self::GetFileId { name } | Self::CreateFile { name } => {
                pack_string(&mut dst, name, 64)
            }
            Self::ReadFileData {
                file_id,
                position,
                length,
            } => {
                dst.put_u8(*file_id);
                dst.put_u32_le(*position);
                dst.put_u32_le(*length);
            }
            Self::WriteFileData {
                file_id,
                position,
                length,
                data,
            } => {
                dst.put_u8(*file_id);
                dst.put_u32_le(*position);
                dst.put_u32_le(*length);
                dst.put_slice(data);
            }
            Self::RemoveFile { file_id } => dst.put_u8(*file_id),
            Self::RequestRoute {
                dest_ip,
                dest_short,
                dest_flags,
            } => {
                pack_ipv4(&mut dst, *dest_ip);
                dst.put_u16_le(*dest_short);
                dst.put_u8(*dest_flags);
            }
            Self::SetKv { params } => {
                for param in params {
                    param.pack(&mut dst)?;
                }
            }
            Self::GetKv { requests } => {
                for request in requests {
                    request.pack(&mut dst);
                }
            }
            Self::SetKvServer { ip, port } => {
                pack_ipv4(&mut dst, *ip);
                dst.put_u16_le(*port);
            }
            Self::SetSecurityKey { key_id, key } => {
                dst.put_u8(*key_id);
                pack_key128(&mut dst, key)?;
            }
        }

        Ok(dst.to_vec())
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let msg_type = get_u16(&mut buf)?;

        Ok(match msg_type {
            1 => Self::Echo {
                echo_data: unpack_string(&mut buf, 128)?,
            },
            2 => Self::Reboot,
            3 => Self::SafeMode,
            4 => Self::LoadFirmware,
            10 => Self::FormatFs,
            20 => Self::GetFileId {
                name: unpack_string(&mut buf, 64)?,
            },
            21 => Self::CreateFile {
                name: unpack_string(&mut buf, 64)?,
            },
            22 => Self::ReadFileData {
                file_id: get_u8(&mut buf)?,
                position: get_u32(&mut buf)?,
                length: get_u32(&mut buf)?,
            },
            23 => Self::WriteFileData {
                file_id: get_u8(&mut buf)?,
                position: get_u32(&mut buf)?,
                length: get_u32(&mut buf)?,
                data: buf.to_vec(),
            },
            24 => Self::RemoveFile {
                file_id: get_u8(&mut buf)?,
            },
            32 => Self::ResetCfg,
            50 => Self::RequestRoute {
                dest_ip: unpack_ipv4(&mut buf)?,
                dest_short: get_u16(&mut buf)?,
                dest_flags: get_u8(&mut buf)?,
            },
            70 => Self::ResetTimeSync,
            80 => Self::SetKv {
                params: unpack_array(buf, KvParam::unpack)?,
            },
            81 => Self::GetKv {
                requests: unpack_array(buf, KvRequest::unpack)?,
            },
            85 => Self::SetKvServer {
                ip: unpack_ipv4(&mut buf)?,
                port: get_u16(&mut buf)?,
            },
            90 => Self::SetSecurityKey {
                key_id: get_u8(&mut buf)?,
                key: unpack_key128(&mut buf)?,
            },
            other => return Err(NetError::UnknownMessageType(other)),
        })
    }
}

/// Responses mirroring the device command set
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceReply {
    Echo { echo_data: String },
    Reboot,
    SafeMode,
    LoadFirmware,
    FormatFs,
    GetFileId { file_id: i8 },
    CreateFile { file_id: i8 },
    ReadFileData { data: Vec<u8> },
    WriteFileData { write_length: u16 },
    RemoveFile { status: i8 },
    ResetCfg,
    RequestRoute,
    ResetTimeSync,
    SetKv { statuses: Vec<KvStatus> },
    GetKv { params: Vec<KvParam> },
    SetKvServer,
    SetSecurityKey,
}

impl DeviceReply {
    pub fn msg_type(&self) -> u16 {
        match self {
            Self::Echo { .. } => 1,
            Self::Reboot => 2,
            Self::SafeMode => 3,
            Self::LoadFirmware => 4,
            Self::FormatFs => 10,
            Self::GetFileId { .. } => 20,
            Self::CreateFile { .. } => 21,
            Self::ReadFileData { .. } => 22,
            Self::WriteFileData { .. } => 23,
            Self::RemoveFile { .. } => 24,
            Self::ResetCfg => 32,
            Self::RequestRoute => 50,
            Self::ResetTimeSync => 70,
            Self::SetKv { .. } => 80,
            Self::GetKv { .. } => 81,
            Self::SetKvServer => 85,
            Self::SetSecurityKey => 90,
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut dst = BytesMut::new();
        dst.put_u16_le(self.msg_type());

        match self {
            Self::Echo { echo_data } => pack_string(&mut dst, echo_data, 128),
            Self::Reboot
            | Self::SafeMode
            | Self::LoadFirmware
            | Self::FormatFs
            | Self::ResetCfg
            | Self::RequestRoute
            | Self::ResetTimeSync
            | Self::SetKvServer
            | Self::SetSecurityKey => {}
            Self::GetFileId { file_id } | Self::CreateFile { file_id } => dst.put_i8(*file_id),
            Self::ReadFileData { data } => dst.put_slice(data),
            Self::WriteFileData { write_length } => dst.put_u16_le(*write_length),
            Self::RemoveFile { status } => dst.put_i8(*status),
            Self::SetKv { statuses } => {
                for status in statuses {
                    status.pack(&mut dst);
                }
            }
            Self::GetKv { params } => {
                for param in params {
                    param.pack(&mut dst)?;
                }
            }
        }

        Ok(dst.to_vec())
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let msg_type = get_u16(&mut buf)?;

        Ok(match msg_type {
            1 => Self::Echo {
                echo_data: unpack_string(&mut buf, 128)?,
            },
            2 => Self::Reboot,
            3 => Self::SafeMode,
            4 => Self::LoadFirmware,
            10 => Self::FormatFs,
            20 => Self::GetFileId {
                file_id: get_i8(&mut buf)?,
            },
            21 => Self::CreateFile {
                file_id: get_i8(&mut buf)?,
            },
            22 => Self::ReadFileData { data: buf.to_vec() },
            23 => Self::WriteFileData {
                write_length: get_u16(&mut buf)?,
            },
            24 => Self::RemoveFile {
                status: get_i8(&mut buf)?,
            },
            32 => Self::ResetCfg,
            50 => Self::RequestRoute,
            70 => Self::ResetTimeSync,
            80 => Self::SetKv {
                statuses: unpack_array(buf, KvStatus::unpack)?,
            },
            81 => Self::GetKv {
                params: unpack_array(buf, KvParam::unpack)?,
            },
            85 => Self::SetKvServer,
            90 => Self::SetSecurityKey,
            other => return Err(NetError::UnknownMessageType(other)),
        })
    }
}

/// Unsolicited notification pushed by devices to the notification server.
/// The value bytes stay raw until the receiver has checked `data_type`
/// against the device's KV metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub flags: u8,
    pub device_id: u64,
    pub timestamp: NtpTimestamp,
    pub group: u8,
    pub id: u8,
    pub data_type: i8,
    pub data: Vec<u8>,
}

impl Notification {
    pub const MSG_TYPE: u8 = 1;

    pub fn pack(&self) -> Vec<u8> {
        let mut dst = BytesMut::new();
        dst.put_u8(Self::MSG_TYPE);
        dst.put_u8(self.flags);
        dst.put_u64_le(self.device_id);
        self.timestamp.pack(&mut dst);
        dst.put_u8(self.group);
        dst.put_u8(self.id);
        dst.put_i8(self.data_type);
        dst.put_slice(&self.data);
        dst.to_vec()
    }

    pub fn unpack(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        let msg_type = get_u8(&mut buf)?;
        if msg_type != Self::MSG_TYPE {
            return Err(NetError::UnknownMessageType(msg_type as u16));
        }

        Ok(Self {
            flags: get_u8(&mut buf)?,
            device_id: get_u64(&mut buf)?,
            timestamp: NtpTimestamp::unpack(&mut buf)?,
            group: get_u8(&mut buf)?,
            id: get_u8(&mut buf)?,
            data_type: get_i8(&mut buf)?,
            data: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KvValue, WireType};

    #[test]
    fn test_gateway_poll_layout() {
        let msg = GatewayMessage::PollGateway { short_addr: 6 };
        let packed = msg.pack();
        assert_eq!(packed, vec![0x01, 0x06, 0x00]);
        assert_eq!(GatewayMessage::unpack(&packed).unwrap(), msg);
    }

    #[test]
    fn test_gateway_token_roundtrip() {
        let msg = GatewayMessage::GatewayToken {
            token: 0xaabbccdd,
            short_addr: 1,
            device_id: 93_372_036_854,
        };
        assert_eq!(GatewayMessage::unpack(&msg.pack()).unwrap(), msg);
    }

    #[test]
    fn test_device_command_type_prefix() {
        let cmd = DeviceCommand::Echo {
            echo_data: "hello".into(),
        };
        let packed = cmd.pack().unwrap();

        // u16 little-endian message type, then the declared fields
        assert_eq!(&packed[..2], &[0x01, 0x00]);
        assert_eq!(packed.len(), 2 + 128);
        assert_eq!(DeviceCommand::unpack(&packed).unwrap(), cmd);
    }

    #[test]
    fn test_device_command_roundtrips() {
        let commands = vec![
            DeviceCommand::Reboot,
            DeviceCommand::GetFileId {
                name: "kvmeta".into(),
            },
            DeviceCommand::ReadFileData {
                file_id: 3,
                position: 512,
                length: 512,
            },
            DeviceCommand::WriteFileData {
                file_id: 3,
                position: 0,
                length: 4,
                data: vec![1, 2, 3, 4],
            },
            DeviceCommand::RequestRoute {
                dest_ip: "10.0.0.9".parse().unwrap(),
                dest_short: 9,
                dest_flags: 0,
            },
            DeviceCommand::SetKvServer {
                ip: "192.168.1.5".parse().unwrap(),
                port: NOTIFICATION_SERVER_PORT,
            },
            DeviceCommand::SetSecurityKey {
                key_id: 1,
                key: "00112233445566778899aabbccddeeff".into(),
            },
            DeviceCommand::GetKv {
                requests: vec![KvRequest {
                    group: 2,
                    id: 1,
                    ty: WireType::Uint32,
                }],
            },
            DeviceCommand::SetKv {
                params: vec![KvParam {
                    group: 1,
                    id: 4,
                    ty: WireType::Bool,
                    value: KvValue::Bool(true),
                }],
            },
        ];

        for cmd in commands {
            let packed = cmd.pack().unwrap();
            assert_eq!(DeviceCommand::unpack(&packed).unwrap(), cmd);
        }
    }

    #[test]
    fn test_device_reply_roundtrips() {
        let replies = vec![
            DeviceReply::Echo {
                echo_data: "pong".into(),
            },
            DeviceReply::GetFileId { file_id: -1 },
            DeviceReply::ReadFileData {
                data: vec![9; 100],
            },
            DeviceReply::WriteFileData { write_length: 512 },
            DeviceReply::SetKv {
                statuses: vec![KvStatus {
                    group: 1,
                    id: 4,
                    status: 0,
                }],
            },
            DeviceReply::GetKv {
                params: vec![
                    KvParam {
                        group: 2,
                        id: 1,
                        ty: WireType::Uint32,
                        value: KvValue::Uint(42),
                    },
                    KvParam {
                        group: 2,
                        id: 2,
                        ty: WireType::String128,
                        value: KvValue::Text("node7".into()),
                    },
                ],
            },
        ];

        for reply in replies {
            let packed = reply.pack().unwrap();
            assert_eq!(DeviceReply::unpack(&packed).unwrap(), reply);
        }
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        assert!(matches!(
            GatewayMessage::unpack(&[0x77]),
            Err(NetError::UnknownMessageType(0x77))
        ));
        assert!(matches!(
            DeviceReply::unpack(&[0xff, 0x7f]),
            Err(NetError::UnknownMessageType(0x7fff))
        ));
        assert!(matches!(
            Notification::unpack(&[0x02, 0, 0]),
            Err(NetError::UnknownMessageType(2))
        ));
    }

    #[test]
    fn test_notification_roundtrip() {
        let msg = Notification {
            flags: 0,
            device_id: 1234,
            timestamp: NtpTimestamp {
                seconds: 3_900_000_000,
                fraction: 0x8000_0000,
            },
            group: 2,
            id: 9,
            data_type: WireType::Uint32.code(),
            data: vec![0x2a, 0, 0, 0],
        };

        let packed = msg.pack();
        assert_eq!(Notification::unpack(&packed).unwrap(), msg);
    }
}
