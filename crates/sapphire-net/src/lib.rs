//! Sapphire Net Library
//!
//! The device-facing protocol stack: the little-endian field codec, the
//! structured records devices export, the type-tagged message protocols,
//! UDPX reliable datagrams with client-side retries, and the serial
//! fallback link.
//!
//! # Modules
//!
//! - [`fields`]: binary field primitives
//! - [`types`]: KV parameter wire types and values
//! - [`data`]: structured device records
//! - [`protocol`]: message registries and ports
//! - [`udpx`]: reliable datagrams over UDP
//! - [`serial`]: serial framed link
//! - [`channel`]: channel selection per device

pub mod channel;
pub mod data;
pub mod error;
pub mod fields;
pub mod protocol;
pub mod serial;
pub mod types;
pub mod udpx;

pub use channel::Channel;
pub use error::{NetError, Result};
pub use types::{KvValue, WireType};
pub use udpx::SocketPool;
