//! Device KV metadata
//!
//! Every device exports a table mapping parameter names to their
//! `(group, id, type, flags)` tuple. The session keeps the table, with the
//! last value seen per parameter, to translate between names and wire
//! addressing.

use crate::error::{DeviceError, Result};
use sapphire_net::data::KvMetaEntry;
use sapphire_net::types::WireType;
use serde_json::Value;
use std::collections::HashMap;

// Key value groups
pub const KV_GROUP_NULL: u8 = 0;
pub const KV_GROUP_NULL1: u8 = 254;
pub const KV_GROUP_SYS_CFG: u8 = 1;
pub const KV_GROUP_SYS_INFO: u8 = 2;
pub const KV_GROUP_SYS_STATS: u8 = 3;
pub const KV_GROUP_APP_BASE: u8 = 32;
pub const KV_GROUP_ALL: u8 = 255;

/// Addresses the whole group in notifications
pub const KV_ID_ALL: u8 = 255;

// Key value flags
pub const KV_FLAGS_READ_ONLY: u16 = 0x0001;
pub const KV_FLAGS_PERSIST: u16 = 0x0004;

/// Well-known group names, used when a notification addresses a whole group
pub fn group_name(group: u8) -> Option<&'static str> {
    Some(match group {
        KV_GROUP_NULL => "kv_group_null",
        KV_GROUP_NULL1 => "kv_group_null_1",
        KV_GROUP_SYS_CFG => "kv_group_sys_cfg",
        KV_GROUP_SYS_INFO => "kv_group_sys_info",
        KV_GROUP_SYS_STATS => "kv_group_sys_stats",
        KV_GROUP_ALL => "kv_group_all",
        _ => return None,
    })
}

/// One parameter the device exports
#[derive(Clone, Debug)]
pub struct KvKey {
    pub key: String,
    pub group: u8,
    pub id: u8,
    pub ty: WireType,
    pub flags: u16,
    /// Last value seen on the wire
    pub value: Option<Value>,
}

impl KvKey {
    pub fn is_read_only(&self) -> bool {
        self.flags & KV_FLAGS_READ_ONLY != 0
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & KV_FLAGS_PERSIST != 0
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.is_read_only() {
            names.push("read_only");
        }
        if self.is_persistent() {
            names.push("persist");
        }
        names
    }
}

/// The device's parameter table
#[derive(Clone, Debug, Default)]
pub struct KvMeta {
    items: HashMap<String, KvKey>,
}

impl KvMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from decoded `kvmeta` records, rejecting duplicate
    /// names and duplicate (group, id) pairs.
    pub fn from_entries(entries: Vec<KvMetaEntry>) -> Result<Self> {
        let mut meta = Self::new();

        for entry in entries {
            meta.insert(KvKey {
                key: entry.param_name.clone(),
                group: entry.group,
                id: entry.id,
                ty: entry.ty,
                flags: entry.flags,
                value: None,
            })?;
        }

        meta.check_duplicate_ids()?;
        Ok(meta)
    }

    pub fn insert(&mut self, key: KvKey) -> Result<()> {
        if self.items.contains_key(&key.key) {
            return Err(DeviceError::DuplicateKeyName(key.key));
        }
        self.items.insert(key.key.clone(), key);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&KvKey> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut KvKey> {
        self.items.get_mut(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Translate wire addressing back to a parameter name. Whole-group ids
    /// fall back to the group-name table.
    pub fn translate(&self, group: u8, id: u8) -> Result<String> {
        if id == KV_ID_ALL {
            return group_name(group)
                .map(str::to_string)
                .ok_or(DeviceError::UnknownKey(format!("group {}", group)));
        }

        self.items
            .values()
            .find(|k| k.group == group && k.id == id)
            .map(|k| k.key.clone())
            .ok_or(DeviceError::UnknownKey(format!(
                "group {} id {}",
                group, id
            )))
    }

    fn check_duplicate_ids(&self) -> Result<()> {
        let mut seen: HashMap<(u8, u8), &str> = HashMap::new();

        for key in self.items.values() {
            if seen.insert((key.group, key.id), &key.key).is_some() {
                return Err(DeviceError::DuplicateKeyId {
                    group: key.group,
                    id: key.id,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, group: u8, id: u8, ty: WireType, flags: u16) -> KvMetaEntry {
        KvMetaEntry {
            group,
            id,
            ty,
            flags,
            param_name: name.to_string(),
        }
    }

    #[test]
    fn test_translate() {
        let meta = KvMeta::from_entries(vec![
            entry("sys_time", KV_GROUP_SYS_INFO, 1, WireType::Uint32, 0),
            entry("name", KV_GROUP_SYS_CFG, 1, WireType::String128, 0),
        ])
        .unwrap();

        assert_eq!(meta.translate(KV_GROUP_SYS_INFO, 1).unwrap(), "sys_time");
        assert_eq!(meta.translate(KV_GROUP_SYS_CFG, 1).unwrap(), "name");
        assert!(matches!(
            meta.translate(KV_GROUP_SYS_STATS, 9),
            Err(DeviceError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_whole_group_fallback() {
        let meta = KvMeta::new();
        assert_eq!(
            meta.translate(KV_GROUP_SYS_STATS, KV_ID_ALL).unwrap(),
            "kv_group_sys_stats"
        );
        assert!(meta.translate(77, KV_ID_ALL).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = KvMeta::from_entries(vec![
            entry("sys_time", 2, 1, WireType::Uint32, 0),
            entry("sys_time", 2, 2, WireType::Uint32, 0),
        ]);
        assert!(matches!(result, Err(DeviceError::DuplicateKeyName(_))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = KvMeta::from_entries(vec![
            entry("a", 2, 1, WireType::Uint32, 0),
            entry("b", 2, 1, WireType::Uint32, 0),
        ]);
        assert!(matches!(result, Err(DeviceError::DuplicateKeyId { .. })));
    }

    #[test]
    fn test_flags() {
        let key = KvKey {
            key: "short_addr".into(),
            group: 1,
            id: 2,
            ty: WireType::Uint16,
            flags: KV_FLAGS_READ_ONLY | KV_FLAGS_PERSIST,
            value: None,
        };

        assert!(key.is_read_only());
        assert_eq!(key.flag_names(), vec!["read_only", "persist"]);
    }
}
