//! Binary field primitives
//!
//! Everything on the device wire is little-endian and decodes from the
//! front of a shrinking byte slice, leaving the tail for the next field.
//! These helpers are the single source of truth for the wire form of the
//! non-scalar field kinds: NUL-padded strings, MAC addresses, 128-bit keys,
//! IPv4 addresses, and UUIDs.

use crate::error::{NetError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub const MAC48_LEN: usize = 6;
pub const MAC64_LEN: usize = 8;
pub const KEY128_LEN: usize = 16;

/// Check that `buf` still holds at least `needed` bytes
pub fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(NetError::Truncated {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Take `n` bytes off the front of the buffer
pub fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    ensure(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}

/// Decode a NUL-padded fixed-width string, stripping non-printable bytes
pub fn unpack_string(buf: &mut &[u8], len: usize) -> Result<String> {
    let raw = take(buf, len)?;
    Ok(raw
        .iter()
        .copied()
        .filter(|b| printable(*b))
        .map(char::from)
        .collect())
}

/// Encode a string into a NUL-padded fixed-width slot
pub fn pack_string(dst: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let used = bytes.len().min(len);
    dst.put_slice(&bytes[..used]);
    dst.put_bytes(0, len - used);
}

/// Decode a string of unknown width by scanning to the NUL terminator;
/// consumes the terminator as well.
pub fn unpack_cstring(buf: &mut &[u8]) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(NetError::Truncated {
            needed: buf.len() + 1,
            have: buf.len(),
        })?;

    let raw = take(buf, end + 1)?;
    Ok(raw[..end]
        .iter()
        .copied()
        .filter(|b| printable(*b))
        .map(char::from)
        .collect())
}

/// Decode a MAC address as colon-separated lowercase hex
pub fn unpack_mac(buf: &mut &[u8], len: usize) -> Result<String> {
    let raw = take(buf, len)?;
    Ok(raw
        .iter()
        .map(|b| format!("{:x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Encode a colon-separated MAC address
pub fn pack_mac(dst: &mut BytesMut, s: &str, len: usize) -> Result<()> {
    let tokens: Vec<&str> = s.split(':').collect();
    if tokens.len() != len {
        return Err(NetError::InvalidValue(format!(
            "mac {} must have {} octets",
            s, len
        )));
    }

    for token in tokens {
        let octet = u8::from_str_radix(token, 16)
            .map_err(|_| NetError::InvalidValue(format!("bad mac octet: {}", token)))?;
        dst.put_u8(octet);
    }
    Ok(())
}

/// Decode a 128-bit key as 32 hex characters
pub fn unpack_key128(buf: &mut &[u8]) -> Result<String> {
    let raw = take(buf, KEY128_LEN)?;
    Ok(raw.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Encode a 128-bit key given as 32 hex characters
pub fn pack_key128(dst: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() != KEY128_LEN * 2 {
        return Err(NetError::InvalidValue(format!(
            "key size must be {} bytes",
            KEY128_LEN
        )));
    }

    for i in 0..KEY128_LEN {
        let octet = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| NetError::InvalidValue(format!("bad key hex: {}", s)))?;
        dst.put_u8(octet);
    }
    Ok(())
}

/// Decode an IPv4 address (wire order is the textual octet order)
pub fn unpack_ipv4(buf: &mut &[u8]) -> Result<Ipv4Addr> {
    let raw = take(buf, 4)?;
    Ok(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
}

pub fn pack_ipv4(dst: &mut BytesMut, addr: Ipv4Addr) {
    dst.put_slice(&addr.octets());
}

/// Decode a 128-bit UUID in byte order
pub fn unpack_uuid(buf: &mut &[u8]) -> Result<Uuid> {
    let raw = take(buf, 16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Ok(Uuid::from_bytes(bytes))
}

pub fn pack_uuid(dst: &mut BytesMut, uuid: &Uuid) {
    dst.put_slice(uuid.as_bytes());
}

/// Little-endian scalar getters with bounds checks
pub fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i8(buf: &mut &[u8]) -> Result<i8> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

pub fn get_bool(buf: &mut &[u8]) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn get_i16(buf: &mut &[u8]) -> Result<i16> {
    ensure(buf, 2)?;
    Ok(buf.get_i16_le())
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn get_f32(buf: &mut &[u8]) -> Result<f32> {
    ensure(buf, 4)?;
    Ok(buf.get_f32_le())
}
