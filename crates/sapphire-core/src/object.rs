//! Replicated objects
//!
//! A `KvObject` is the unit of replicated state: a string-keyed attribute
//! bag tagged with a collection name, the origin that created it, and an
//! update timestamp. Only the originating process may add attribute keys or
//! delete the object; any process may update the value of an existing key.
//! Attribute writes on a published object buffer per-key change events which
//! the exchange flushes as one batch on the next publish.

use crate::error::{CoreError, Result};
use crate::event::{format_timestamp, parse_timestamp, utc_now, KvEvent};
use crate::origin::Origin;
use crate::query::Query;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct KvObject {
    /// True when this process created the object
    originator: bool,
    state: Mutex<ObjectState>,
}

struct ObjectState {
    object_id: String,
    origin_id: String,
    /// Origin of this process, stamped onto outgoing events
    local_origin: String,
    collection: Option<String>,
    updated_at: DateTime<Utc>,
    attrs: Map<String, Value>,
    /// Change events buffered until the next publish, last write per key
    pending: HashMap<String, KvEvent>,
    published: bool,
}

impl KvObject {
    /// Create a new local object with a random id
    pub fn new(origin: &Origin, collection: Option<&str>) -> Arc<Self> {
        Self::with_id(origin, Uuid::new_v4().to_string(), collection)
    }

    /// Create a new local object with an explicit id
    pub fn with_id(
        origin: &Origin,
        object_id: impl Into<String>,
        collection: Option<&str>,
    ) -> Arc<Self> {
        Arc::new(Self {
            originator: true,
            state: Mutex::new(ObjectState {
                object_id: object_id.into(),
                origin_id: origin.as_str().to_string(),
                local_origin: origin.as_str().to_string(),
                collection: collection.map(str::to_string),
                updated_at: utc_now(),
                attrs: Map::new(),
                pending: HashMap::new(),
                published: false,
            }),
        })
    }

    /// Reconstruct an object from its dictionary form, as received from a
    /// remote peer. Header fields are peeled off; everything else lands in
    /// the attribute bag.
    pub fn from_map(d: &Map<String, Value>, local_origin: &Origin) -> Result<Arc<Self>> {
        let object_id = match d.get("object_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let origin_id = d
            .get("origin_id")
            .and_then(Value::as_str)
            .unwrap_or(local_origin.as_str())
            .to_string();

        let updated_at = match d.get("updated_at").and_then(Value::as_str) {
            Some(s) => parse_timestamp(s)?,
            None => utc_now(),
        };

        let collection = d
            .get("collection")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut attrs = Map::new();
        for (k, v) in d {
            match k.as_str() {
                "object_id" | "origin_id" | "updated_at" | "collection" => {}
                _ => {
                    attrs.insert(k.clone(), v.clone());
                }
            }
        }

        Ok(Arc::new(Self {
            originator: origin_id == local_origin.as_str(),
            state: Mutex::new(ObjectState {
                object_id,
                origin_id,
                local_origin: local_origin.as_str().to_string(),
                collection,
                updated_at,
                attrs,
                pending: HashMap::new(),
                published: false,
            }),
        }))
    }

    pub fn object_id(&self) -> String {
        self.state.lock().object_id.clone()
    }

    pub fn origin_id(&self) -> String {
        self.state.lock().origin_id.clone()
    }

    pub fn collection(&self) -> Option<String> {
        self.state.lock().collection.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.lock().updated_at
    }

    pub fn is_originator(&self) -> bool {
        self.originator
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().attrs.get(key).cloned()
    }

    /// Snapshot of the attribute bag
    pub fn attrs(&self) -> Map<String, Value> {
        self.state.lock().attrs.clone()
    }

    /// Assign an attribute through the originator rules: the originator may
    /// add new keys, anyone may update an existing one. On a published
    /// object the write buffers a change event for the next publish.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.set_inner(key, value.into(), None)
    }

    /// `set` with an explicit update timestamp (notification intake stamps
    /// device attributes with the device's NTP-derived time).
    pub fn set_at(&self, key: &str, value: impl Into<Value>, timestamp: DateTime<Utc>) -> Result<()> {
        self.set_inner(key, value.into(), Some(timestamp))
    }

    fn set_inner(&self, key: &str, value: Value, timestamp: Option<DateTime<Utc>>) -> Result<()> {
        let mut st = self.state.lock();

        if !st.attrs.contains_key(key) && !self.originator {
            return Err(CoreError::NotOriginator {
                object_id: st.object_id.clone(),
            });
        }

        st.attrs.insert(key.to_string(), value.clone());
        st.updated_at = timestamp.unwrap_or_else(utc_now);

        if st.published {
            let event = KvEvent {
                object_id: st.object_id.clone(),
                origin_id: st.local_origin.clone(),
                key: key.to_string(),
                value,
                timestamp: utc_now(),
            };
            st.pending.insert(key.to_string(), event);
        }

        Ok(())
    }

    /// Apply an incoming remote value: no originator check, no event
    /// emission.
    pub fn update(&self, key: &str, value: Value, timestamp: Option<DateTime<Utc>>) {
        let mut st = self.state.lock();
        st.attrs.insert(key.to_string(), value);
        st.updated_at = timestamp.unwrap_or_else(utc_now);
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let st = self.state.lock();

        let mut d = Map::new();
        d.insert("object_id".into(), Value::String(st.object_id.clone()));
        d.insert("origin_id".into(), Value::String(st.origin_id.clone()));
        d.insert(
            "updated_at".into(),
            Value::String(format_timestamp(&st.updated_at)),
        );
        d.insert(
            "collection".into(),
            st.collection
                .as_ref()
                .map(|c| Value::String(c.clone()))
                .unwrap_or(Value::Null),
        );

        for (k, v) in &st.attrs {
            d.insert(k.clone(), v.clone());
        }

        d
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.to_map()).to_string()
    }

    pub fn matches(&self, query: &Query) -> bool {
        query.matches(&self.to_map())
    }

    pub(crate) fn set_published(&self, published: bool) {
        self.state.lock().published = published;
    }

    pub(crate) fn touch(&self) {
        self.state.lock().updated_at = utc_now();
    }

    /// Drain the buffered change events
    pub(crate) fn take_pending(&self) -> Vec<KvEvent> {
        let mut st = self.state.lock();
        st.pending.drain().map(|(_, ev)| ev).collect()
    }
}

impl std::fmt::Display for KvObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        match &st.collection {
            Some(c) => write!(f, "KvObject:{}.{}", c, st.object_id),
            None => write!(f, "KvObject:{}", st.object_id),
        }
    }
}
