//! Per-attribute change events
//!
//! An event records one attribute assignment on a published object. Events
//! are buffered on the object until the next publish, travel across the
//! broker as primitive fields, and are re-attached to their object when
//! delivered to local subscribers.

use crate::error::{CoreError, Result};
use crate::object::KvObject;
use crate::origin::Origin;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Wire timestamp format: ISO-8601 UTC with microseconds
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Timestamps never carry more precision than the wire format does
pub(crate) fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")?;
    Ok(naive.and_utc())
}

/// A single attribute change on an object
#[derive(Clone, Debug)]
pub struct KvEvent {
    pub object_id: String,
    pub origin_id: String,
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl KvEvent {
    pub fn new(
        object_id: impl Into<String>,
        key: impl Into<String>,
        value: Value,
        origin: &Origin,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            origin_id: origin.as_str().to_string(),
            key: key.into(),
            value,
            timestamp: utc_now(),
        }
    }

    /// Keys beginning with an underscore are private to the process and are
    /// kept off the long-poll event bus.
    pub fn is_private(&self) -> bool {
        self.key.starts_with('_')
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut d = Map::new();
        d.insert("object_id".into(), Value::String(self.object_id.clone()));
        d.insert("origin_id".into(), Value::String(self.origin_id.clone()));
        d.insert("key".into(), Value::String(self.key.clone()));
        d.insert("value".into(), self.value.clone());
        d.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        d
    }

    pub fn from_map(d: &Map<String, Value>) -> Result<Self> {
        let field = |key: &str| -> Result<&str> {
            d.get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::Malformed(format!("event missing {key}")))
        };

        Ok(Self {
            object_id: field("object_id")?.to_string(),
            origin_id: field("origin_id")?.to_string(),
            key: field("key")?.to_string(),
            value: d.get("value").cloned().unwrap_or(Value::Null),
            timestamp: parse_timestamp(field("timestamp")?)?,
        })
    }
}

impl std::fmt::Display for KvEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Object:{} Key:{} Value:{} Timestamp:{}",
            self.object_id, self.key, self.value, self.timestamp
        )
    }
}

/// An event paired with the local object it applies to, as delivered to
/// dispatcher subscribers. The object reference is absent when the event
/// arrived for an object this process has never seen.
#[derive(Clone)]
pub struct EventRef {
    pub event: KvEvent,
    pub object: Option<Arc<KvObject>>,
}

impl EventRef {
    pub fn detached(event: KvEvent) -> Self {
        Self { event, object: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let origin = Origin::generate();
        let event = KvEvent::new("o1", "temperature", json!(21.5), &origin);

        let decoded = KvEvent::from_map(&event.to_map()).unwrap();
        assert_eq!(decoded.object_id, "o1");
        assert_eq!(decoded.key, "temperature");
        assert_eq!(decoded.value, json!(21.5));
        assert_eq!(decoded.origin_id, origin.as_str());
        assert_eq!(decoded.timestamp, event.timestamp);
    }

    #[test]
    fn test_private_keys() {
        let origin = Origin::generate();
        assert!(KvEvent::new("o1", "_keys", json!(1), &origin).is_private());
        assert!(!KvEvent::new("o1", "keys", json!(1), &origin).is_private());
    }

    #[test]
    fn test_malformed_event() {
        let mut d = Map::new();
        d.insert("object_id".into(), json!("o1"));
        assert!(KvEvent::from_map(&d).is_err());
    }
}
