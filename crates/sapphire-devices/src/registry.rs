//! Device session registry
//!
//! One session per physical device, keyed by the 64-bit device id. The
//! scanner creates sessions on discovery; the monitor and notification
//! server look them up.

use crate::device::Device;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<HashMap<u64, Arc<Device>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: u64) -> Option<Arc<Device>> {
        self.devices.lock().get(&device_id).cloned()
    }

    /// Return the existing session or build one. Concurrent callers may
    /// both build; the first insert wins.
    pub fn get_or_insert(
        &self,
        device_id: u64,
        make: impl FnOnce() -> Result<Arc<Device>>,
    ) -> Result<Arc<Device>> {
        if let Some(device) = self.get(device_id) {
            return Ok(device);
        }

        let device = make()?;
        Ok(self
            .devices
            .lock()
            .entry(device_id)
            .or_insert(device)
            .clone())
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapphire_core::{Exchange, Store};
    use sapphire_net::udpx::SocketPool;

    #[test]
    fn test_get_or_insert_reuses() {
        let registry = DeviceRegistry::new();
        let exchange = Exchange::new();
        let dir = tempfile::tempdir().unwrap().into_path();
        let store = Arc::new(Store::open(dir).unwrap());
        let pool = SocketPool::new();

        let a = registry
            .get_or_insert(1, || {
                Device::new(&exchange, &store, &pool, "127.0.0.1", 16385, 1, 1)
            })
            .unwrap();
        let b = registry
            .get_or_insert(1, || {
                panic!("existing session must be reused")
            })
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
