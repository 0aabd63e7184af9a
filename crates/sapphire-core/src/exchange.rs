//! Process-local object registry
//!
//! The exchange owns the `object_id -> object` map for this process and the
//! replication traffic around it: publishing inserts locally and broadcasts
//! the full object, attribute writes flush as event batches, and inbound
//! remote messages are applied under the registry lock before any local
//! subscriber hears about them.

use crate::dispatcher::{Dispatcher, Signal};
use crate::error::{CoreError, Result};
use crate::event::{EventRef, KvEvent};
use crate::object::KvObject;
use crate::origin::Origin;
use crate::query::Query;
use crate::transport::Envelope;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle to the process-wide registry; clones share state.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    origin: Origin,
    objects: Mutex<HashMap<String, Arc<KvObject>>>,
    dispatcher: Dispatcher,
    /// Outbound queue toward the broker; absent until a transport attaches
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Set while a bootstrap `request_objects` round is outstanding
    catching_up: AtomicBool,
}

impl Exchange {
    /// Create a standalone exchange with a fresh origin. Broker replication
    /// starts when a transport attaches.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                origin: Origin::generate(),
                objects: Mutex::new(HashMap::new()),
                dispatcher: Dispatcher::new(),
                outbound: Mutex::new(None),
                catching_up: AtomicBool::new(false),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// True between a bootstrap `request_objects` and the first remote
    /// publish that answers it.
    pub fn catching_up(&self) -> bool {
        self.inner.catching_up.load(Ordering::SeqCst)
    }

    pub fn get(&self, object_id: &str) -> Option<Arc<KvObject>> {
        self.inner.objects.lock().get(object_id).cloned()
    }

    /// All objects matching the query
    pub fn query(&self, query: &Query) -> Vec<Arc<KvObject>> {
        self.inner
            .objects
            .lock()
            .values()
            .filter(|o| o.matches(query))
            .cloned()
            .collect()
    }

    /// Publish an object: broadcast and insert if we are the originator,
    /// then flush any buffered attribute events as one batch.
    pub fn publish(&self, obj: &Arc<KvObject>) {
        if obj.is_originator() {
            debug!("publishing object: {}", obj);

            self.publish_method("publish", Value::Object(obj.to_map()));

            self.inner
                .objects
                .lock()
                .insert(obj.object_id(), obj.clone());
            obj.set_published(true);
        }

        obj.touch();

        let pending = obj.take_pending();
        if !pending.is_empty() {
            debug!("pushing {} events: {}", pending.len(), obj);
            self.send_events(pending);
        }
    }

    /// Delete an object we originated; broadcast the deletion to peers.
    pub fn delete(&self, obj: &Arc<KvObject>) -> Result<()> {
        if !obj.is_originator() {
            return Err(CoreError::NotOriginator {
                object_id: obj.object_id(),
            });
        }

        debug!("unpublishing object: {}", obj);

        let mut data = Map::new();
        data.insert("object_id".into(), Value::String(obj.object_id()));
        self.publish_method("delete", Value::Object(data));

        self.inner.objects.lock().remove(&obj.object_id());
        obj.set_published(false);

        Ok(())
    }

    /// Remove an object deleted by its remote originator.
    pub fn delete_by_id(&self, object_id: &str) {
        if let Some(obj) = self.inner.objects.lock().remove(object_id) {
            debug!("deleted object: {}", obj);
            obj.set_published(false);
        }
    }

    /// Apply an incoming remote object: insert when unknown, otherwise
    /// update every attribute in place without event emission.
    pub fn update(&self, data: &Map<String, Value>) -> Result<()> {
        let incoming = KvObject::from_map(data, &self.inner.origin)?;

        let mut objects = self.inner.objects.lock();
        match objects.get(&incoming.object_id()) {
            Some(existing) => {
                for (k, v) in incoming.attrs() {
                    existing.update(&k, v, None);
                }
            }
            None => {
                debug!("received new object: {}", incoming);
                incoming.set_published(true);
                objects.insert(incoming.object_id(), incoming);
            }
        }

        Ok(())
    }

    /// Apply a batch of remote events atomically, then deliver them to
    /// local subscribers outside the registry lock so no subscriber can
    /// observe a half-applied batch.
    pub fn receive_events(&self, events: Vec<KvEvent>) {
        let mut refs = Vec::with_capacity(events.len());

        {
            let objects = self.inner.objects.lock();
            for event in events {
                let object = objects.get(&event.object_id).cloned();
                if let Some(obj) = &object {
                    obj.update(&event.key, event.value.clone(), Some(event.timestamp));
                }
                refs.push(EventRef { event, object });
            }
        }

        for event_ref in &refs {
            self.inner.dispatcher.send(Signal::ReceivedEvent, event_ref);
        }
    }

    /// Broadcast a batch of local events and deliver the sent signal.
    pub fn send_events(&self, events: Vec<KvEvent>) {
        let data = events.iter().map(|e| Value::Object(e.to_map())).collect();
        self.publish_method("events", Value::Array(data));

        for event in events {
            let object = self.get(&event.object_id);
            self.inner
                .dispatcher
                .send(Signal::SentEvent, &EventRef { event, object });
        }
    }

    /// Ask peers to re-broadcast their object sets (bootstrap catch-up).
    pub fn request_objects(&self) {
        debug!("requesting objects");
        self.inner.catching_up.store(true, Ordering::SeqCst);
        self.publish_method("request_objects", Value::Null);
    }

    /// Re-broadcast every known object (answering `request_objects`).
    pub fn publish_objects(&self) {
        let objects: Vec<_> = self.inner.objects.lock().values().cloned().collect();
        for obj in objects {
            self.publish(&obj);
        }
    }

    /// Delete every object we originated; called at shutdown.
    pub fn unpublish_objects(&self) {
        let objects: Vec<_> = self.inner.objects.lock().values().cloned().collect();
        for obj in objects {
            if obj.is_originator() {
                let _ = self.delete(&obj);
            }
        }
    }

    pub(crate) fn publish_method(&self, method: &str, data: Value) {
        let envelope = Envelope {
            method: method.to_string(),
            origin_id: self.inner.origin.as_str().to_string(),
            data,
        };

        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to encode {} envelope: {}", method, e);
                return;
            }
        };

        // absent sender means no transport is attached; objects stay local
        if let Some(tx) = self.inner.outbound.lock().as_ref() {
            let _ = tx.send(json);
        }
    }

    pub(crate) fn attach_outbound(&self, tx: mpsc::UnboundedSender<String>) {
        *self.inner.outbound.lock() = Some(tx);
    }

    pub(crate) fn detach_outbound(&self) {
        *self.inner.outbound.lock() = None;
    }

    pub(crate) fn clear_catching_up(&self) {
        self.inner.catching_up.store(false, Ordering::SeqCst);
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote_object_map(origin: &Origin, object_id: &str) -> Map<String, Value> {
        let mut d = Map::new();
        d.insert("object_id".into(), json!(object_id));
        d.insert("origin_id".into(), json!(origin.as_str()));
        d.insert("collection".into(), json!("c"));
        d.insert("k".into(), json!(1));
        d
    }

    #[test]
    fn test_publish_inserts_and_flushes_events() {
        let exchange = Exchange::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        exchange.attach_outbound(tx);

        let obj = KvObject::new(exchange.origin(), Some("c"));
        obj.set("k", json!(1)).unwrap();
        exchange.publish(&obj);

        assert!(exchange.get(&obj.object_id()).is_some());

        let envelope: Envelope = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope.method, "publish");
        assert_eq!(envelope.origin_id, exchange.origin().as_str());

        // a mutation after publish buffers an event, flushed on republish
        obj.set("k", json!(2)).unwrap();
        exchange.publish(&obj);

        let methods: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|json| serde_json::from_str::<Envelope>(&json).unwrap().method)
            .collect();
        assert!(methods.contains(&"events".to_string()));
    }

    #[test]
    fn test_query_by_object_id() {
        let exchange = Exchange::new();
        let obj = KvObject::with_id(exchange.origin(), "o1", Some("c"));
        obj.set("k", json!(1)).unwrap();
        exchange.publish(&obj);

        let hits = exchange.query(&Query::new().key("object_id", "o1"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("k"), Some(json!(1)));

        assert!(exchange
            .query(&Query::new().key("object_id", "o2"))
            .is_empty());
    }

    #[test]
    fn test_non_originator_delete_rejected() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        exchange.update(&remote_object_map(&remote, "o1")).unwrap();
        let obj = exchange.get("o1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        exchange.attach_outbound(tx);

        assert!(matches!(
            exchange.delete(&obj),
            Err(CoreError::NotOriginator { .. })
        ));
        // the failed delete must not broadcast
        assert!(rx.try_recv().is_err());
        assert!(exchange.get("o1").is_some());
    }

    #[test]
    fn test_update_inserts_then_merges() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        exchange.update(&remote_object_map(&remote, "o1")).unwrap();
        assert_eq!(exchange.get("o1").unwrap().get("k"), Some(json!(1)));

        let mut d = remote_object_map(&remote, "o1");
        d.insert("k".into(), json!(2));
        exchange.update(&d).unwrap();

        // merged in place, same entry
        let objects = exchange.query(&Query::all());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].get("k"), Some(json!(2)));
    }

    #[test]
    fn test_receive_events_applies_before_delivery() {
        let exchange = Exchange::new();
        let remote = Origin::generate();
        exchange.update(&remote_object_map(&remote, "o1")).unwrap();

        // the subscriber must observe the new value at delivery time
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        exchange
            .dispatcher()
            .connect(Signal::ReceivedEvent, move |ev| {
                let applied = ev.object.as_ref().and_then(|o| o.get(&ev.event.key));
                seen_by_handler.lock().push((ev.event.value.clone(), applied));
            });

        let event = KvEvent::new("o1", "k", json!(42), &remote);
        exchange.receive_events(vec![event]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, json!(42));
        assert_eq!(seen[0].1, Some(json!(42)));
    }

    #[test]
    fn test_receive_event_for_unknown_object() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        let delivered = Arc::new(AtomicBool::new(false));
        let flag = delivered.clone();
        exchange.dispatcher().connect(Signal::ReceivedEvent, move |ev| {
            assert!(ev.object.is_none());
            flag.store(true, Ordering::SeqCst);
        });

        exchange.receive_events(vec![KvEvent::new("nope", "k", json!(1), &remote)]);
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unpublish_objects_deletes_own_only() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        let mine = KvObject::with_id(exchange.origin(), "mine", None);
        exchange.publish(&mine);
        exchange.update(&remote_object_map(&remote, "theirs")).unwrap();

        exchange.unpublish_objects();
        assert!(exchange.get("mine").is_none());
        assert!(exchange.get("theirs").is_some());
    }
}
