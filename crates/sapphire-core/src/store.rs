//! Small persistent key/value table
//!
//! JSON values keyed by strings on the local filesystem; one open handle
//! per process, operations serialized by the storage engine. The device
//! layer keys KV metadata blobs by firmware hash here so a fleet of
//! identically flashed devices only downloads `kvmeta` once.

use crate::error::Result;
use serde_json::Value;
use std::path::Path;

pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.db.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    pub fn keys(&self) -> Vec<String> {
        self.db
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .map(|k| String::from_utf8_lossy(&k).to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(store.get("missing").unwrap().is_none());

        store.put("fw_hash", &json!({"kv_meta": "00ff"})).unwrap();
        let value = store.get("fw_hash").unwrap().unwrap();
        assert_eq!(value["kv_meta"], json!("00ff"));

        assert!(store.contains("fw_hash").unwrap());
        assert_eq!(store.keys(), vec!["fw_hash".to_string()]);

        store.remove("fw_hash").unwrap();
        assert!(store.get("fw_hash").unwrap().is_none());
    }

    #[test]
    fn test_store_persists() {
        let dir = tempdir().unwrap();

        {
            let store = Store::open(dir.path()).unwrap();
            store.put("k", &json!(1)).unwrap();
            store.flush().unwrap();
        }

        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!(1)));
    }
}
