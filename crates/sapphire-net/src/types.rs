//! KV parameter wire types
//!
//! The closed enum of value types a device can export, with their wire
//! codes, sizes, and (de)serialization into a tagged value. The mismatch
//! code appears in responses when the device rejects a typed access.

use crate::error::{NetError, Result};
use crate::fields;
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::net::Ipv4Addr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    None,
    Bool,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float,
    String128,
    Mac48,
    Mac64,
    Key128,
    Ipv4,
    String512,
    /// Device-side type mismatch marker in responses
    Mismatch,
}

impl WireType {
    pub fn from_wire(code: i8) -> Result<Self> {
        Ok(match code {
            0 => Self::None,
            1 => Self::Bool,
            2 => Self::Uint8,
            3 => Self::Int8,
            4 => Self::Uint16,
            5 => Self::Int16,
            6 => Self::Uint32,
            7 => Self::Int32,
            8 => Self::Uint64,
            9 => Self::Int64,
            10 => Self::Float,
            40 => Self::String128,
            41 => Self::Mac48,
            42 => Self::Mac64,
            43 => Self::Key128,
            44 => Self::Ipv4,
            45 => Self::String512,
            -6 => Self::Mismatch,
            other => return Err(NetError::UnknownWireType(other)),
        })
    }

    pub fn code(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Bool => 1,
            Self::Uint8 => 2,
            Self::Int8 => 3,
            Self::Uint16 => 4,
            Self::Int16 => 5,
            Self::Uint32 => 6,
            Self::Int32 => 7,
            Self::Uint64 => 8,
            Self::Int64 => 9,
            Self::Float => 10,
            Self::String128 => 40,
            Self::Mac48 => 41,
            Self::Mac64 => 42,
            Self::Key128 => 43,
            Self::Ipv4 => 44,
            Self::String512 => 45,
            Self::Mismatch => -6,
        }
    }

    /// Packed size of a value of this type
    pub fn size(self) -> usize {
        match self {
            Self::None | Self::Mismatch => 0,
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float | Self::Ipv4 => 4,
            Self::Uint64 | Self::Int64 => 8,
            Self::Mac48 => fields::MAC48_LEN,
            Self::Mac64 => fields::MAC64_LEN,
            Self::Key128 => fields::KEY128_LEN,
            Self::String128 => 128,
            Self::String512 => 512,
        }
    }

    pub fn decode(self, buf: &mut &[u8]) -> Result<KvValue> {
        Ok(match self {
            Self::None | Self::Mismatch => KvValue::Null,
            Self::Bool => KvValue::Bool(fields::get_bool(buf)?),
            Self::Uint8 => KvValue::Uint(fields::get_u8(buf)? as u64),
            Self::Int8 => KvValue::Int(fields::get_i8(buf)? as i64),
            Self::Uint16 => KvValue::Uint(fields::get_u16(buf)? as u64),
            Self::Int16 => KvValue::Int(fields::get_i16(buf)? as i64),
            Self::Uint32 => KvValue::Uint(fields::get_u32(buf)? as u64),
            Self::Int32 => KvValue::Int(fields::get_i32(buf)? as i64),
            Self::Uint64 => KvValue::Uint(fields::get_u64(buf)?),
            Self::Int64 => KvValue::Int(fields::get_i64(buf)?),
            Self::Float => KvValue::Float(fields::get_f32(buf)?),
            Self::String128 => KvValue::Text(fields::unpack_string(buf, 128)?),
            Self::String512 => KvValue::Text(fields::unpack_string(buf, 512)?),
            Self::Mac48 => KvValue::Text(fields::unpack_mac(buf, fields::MAC48_LEN)?),
            Self::Mac64 => KvValue::Text(fields::unpack_mac(buf, fields::MAC64_LEN)?),
            Self::Key128 => KvValue::Text(fields::unpack_key128(buf)?),
            Self::Ipv4 => KvValue::Addr(fields::unpack_ipv4(buf)?),
        })
    }

    pub fn encode(self, value: &KvValue, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::None | Self::Mismatch => {}
            Self::Bool => dst.put_u8(value.as_bool()? as u8),
            Self::Uint8 => dst.put_u8(value.as_uint(u8::MAX as u64)? as u8),
            Self::Int8 => dst.put_i8(value.as_int(i8::MIN as i64, i8::MAX as i64)? as i8),
            Self::Uint16 => dst.put_u16_le(value.as_uint(u16::MAX as u64)? as u16),
            Self::Int16 => dst.put_i16_le(value.as_int(i16::MIN as i64, i16::MAX as i64)? as i16),
            Self::Uint32 => dst.put_u32_le(value.as_uint(u32::MAX as u64)? as u32),
            Self::Int32 => dst.put_i32_le(value.as_int(i32::MIN as i64, i32::MAX as i64)? as i32),
            Self::Uint64 => dst.put_u64_le(value.as_uint(u64::MAX)?),
            Self::Int64 => dst.put_i64_le(value.as_int(i64::MIN, i64::MAX)?),
            Self::Float => dst.put_f32_le(value.as_float()?),
            Self::String128 => fields::pack_string(dst, &value.as_text()?, 128),
            Self::String512 => fields::pack_string(dst, &value.as_text()?, 512),
            Self::Mac48 => fields::pack_mac(dst, &value.as_text()?, fields::MAC48_LEN)?,
            Self::Mac64 => fields::pack_mac(dst, &value.as_text()?, fields::MAC64_LEN)?,
            Self::Key128 => fields::pack_key128(dst, &value.as_text()?)?,
            Self::Ipv4 => fields::pack_ipv4(dst, value.as_addr()?),
        }
        Ok(())
    }
}

/// A decoded KV parameter value
#[derive(Clone, Debug, PartialEq)]
pub enum KvValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f32),
    Text(String),
    Addr(Ipv4Addr),
}

impl KvValue {
    /// Coerce a JSON value toward a wire type. Strings parse leniently the
    /// way console input arrives.
    pub fn from_json(ty: WireType, value: &Value) -> Result<Self> {
        let bad = || NetError::InvalidValue(format!("{:?} cannot hold {}", ty, value));

        Ok(match ty {
            WireType::None | WireType::Mismatch => Self::Null,

            WireType::Bool => match value {
                Value::Bool(b) => Self::Bool(*b),
                Value::Number(n) => Self::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" | "1" => Self::Bool(true),
                    "false" | "0" => Self::Bool(false),
                    _ => return Err(bad()),
                },
                _ => return Err(bad()),
            },

            WireType::Uint8 | WireType::Uint16 | WireType::Uint32 | WireType::Uint64 => {
                match value {
                    Value::Number(n) => Self::Uint(n.as_u64().ok_or_else(bad)?),
                    Value::String(s) => Self::Uint(s.parse().map_err(|_| bad())?),
                    _ => return Err(bad()),
                }
            }

            WireType::Int8 | WireType::Int16 | WireType::Int32 | WireType::Int64 => match value {
                Value::Number(n) => Self::Int(n.as_i64().ok_or_else(bad)?),
                Value::String(s) => Self::Int(s.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            },

            WireType::Float => match value {
                Value::Number(n) => Self::Float(n.as_f64().ok_or_else(bad)? as f32),
                Value::String(s) => Self::Float(s.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            },

            WireType::String128 | WireType::String512 | WireType::Mac48 | WireType::Mac64
            | WireType::Key128 => match value {
                Value::String(s) => Self::Text(s.clone()),
                other => Self::Text(other.to_string()),
            },

            WireType::Ipv4 => match value {
                Value::String(s) => Self::Addr(s.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            },
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Uint(u) => Value::from(*u),
            Self::Float(f) => Value::from(*f as f64),
            Self::Text(s) => Value::String(s.clone()),
            Self::Addr(a) => Value::String(a.to_string()),
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int(i) => Ok(*i != 0),
            Self::Uint(u) => Ok(*u != 0),
            other => Err(NetError::InvalidValue(format!("{:?} is not a bool", other))),
        }
    }

    fn as_uint(&self, max: u64) -> Result<u64> {
        let v = match self {
            Self::Uint(u) => *u,
            Self::Int(i) if *i >= 0 => *i as u64,
            Self::Bool(b) => *b as u64,
            other => {
                return Err(NetError::InvalidValue(format!(
                    "{:?} is not an unsigned integer",
                    other
                )))
            }
        };
        if v > max {
            return Err(NetError::InvalidValue(format!("{} exceeds {}", v, max)));
        }
        Ok(v)
    }

    fn as_int(&self, min: i64, max: i64) -> Result<i64> {
        let v = match self {
            Self::Int(i) => *i,
            Self::Uint(u) if *u <= i64::MAX as u64 => *u as i64,
            Self::Bool(b) => *b as i64,
            other => {
                return Err(NetError::InvalidValue(format!(
                    "{:?} is not a signed integer",
                    other
                )))
            }
        };
        if v < min || v > max {
            return Err(NetError::InvalidValue(format!(
                "{} outside [{}, {}]",
                v, min, max
            )));
        }
        Ok(v)
    }

    fn as_float(&self) -> Result<f32> {
        match self {
            Self::Float(f) => Ok(*f),
            Self::Int(i) => Ok(*i as f32),
            Self::Uint(u) => Ok(*u as f32),
            other => Err(NetError::InvalidValue(format!("{:?} is not a float", other))),
        }
    }

    fn as_text(&self) -> Result<String> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            other => Err(NetError::InvalidValue(format!("{:?} is not a string", other))),
        }
    }

    fn as_addr(&self) -> Result<Ipv4Addr> {
        match self {
            Self::Addr(a) => Ok(*a),
            Self::Text(s) => s
                .parse()
                .map_err(|_| NetError::InvalidValue(format!("bad address: {}", s))),
            other => Err(NetError::InvalidValue(format!(
                "{:?} is not an address",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_codes_roundtrip() {
        for code in [0i8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 40, 41, 42, 43, 44, 45, -6] {
            let ty = WireType::from_wire(code).unwrap();
            assert_eq!(ty.code(), code);
        }
        assert!(WireType::from_wire(99).is_err());
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(WireType::Bool.size(), 1);
        assert_eq!(WireType::Uint32.size(), 4);
        assert_eq!(WireType::Int64.size(), 8);
        assert_eq!(WireType::Float.size(), 4);
        assert_eq!(WireType::String128.size(), 128);
        assert_eq!(WireType::String512.size(), 512);
        assert_eq!(WireType::Mac48.size(), 6);
        assert_eq!(WireType::Key128.size(), 16);
        assert_eq!(WireType::Ipv4.size(), 4);
    }

    #[test]
    fn test_value_roundtrip() {
        let cases = vec![
            (WireType::Bool, KvValue::Bool(true)),
            (WireType::Uint8, KvValue::Uint(200)),
            (WireType::Int16, KvValue::Int(-1234)),
            (WireType::Uint32, KvValue::Uint(70000)),
            (WireType::Int64, KvValue::Int(-5_000_000_000)),
            (WireType::Float, KvValue::Float(1.5)),
            (WireType::Ipv4, KvValue::Addr("10.0.0.1".parse().unwrap())),
            (
                WireType::Key128,
                KvValue::Text("00112233445566778899aabbccddeeff".into()),
            ),
        ];

        for (ty, value) in cases {
            let mut dst = BytesMut::new();
            ty.encode(&value, &mut dst).unwrap();
            assert_eq!(dst.len(), ty.size());

            let mut buf = &dst[..];
            assert_eq!(ty.decode(&mut buf).unwrap(), value);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_string_value_roundtrip() {
        let mut dst = BytesMut::new();
        WireType::String128
            .encode(&KvValue::Text("bedroom_lamp".into()), &mut dst)
            .unwrap();
        assert_eq!(dst.len(), 128);

        let mut buf = &dst[..];
        assert_eq!(
            WireType::String128.decode(&mut buf).unwrap(),
            KvValue::Text("bedroom_lamp".into())
        );
    }

    #[test]
    fn test_json_coercion() {
        assert_eq!(
            KvValue::from_json(WireType::Bool, &json!("false")).unwrap(),
            KvValue::Bool(false)
        );
        assert_eq!(
            KvValue::from_json(WireType::Uint16, &json!("512")).unwrap(),
            KvValue::Uint(512)
        );
        assert_eq!(
            KvValue::from_json(WireType::Ipv4, &json!("10.0.0.2")).unwrap(),
            KvValue::Addr("10.0.0.2".parse().unwrap())
        );
        assert!(KvValue::from_json(WireType::Uint8, &json!(-1)).is_err());
    }

    #[test]
    fn test_range_check() {
        let mut dst = BytesMut::new();
        assert!(WireType::Uint8
            .encode(&KvValue::Uint(300), &mut dst)
            .is_err());
        assert!(WireType::Int8.encode(&KvValue::Int(-200), &mut dst).is_err());
    }
}
