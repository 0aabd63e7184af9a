//! Broker replication
//!
//! Two long-lived tasks per process, both bound to the broker channel
//! `sapphire_objects`. The publisher drains an outbound queue of JSON
//! envelopes and survives broker outages with a 4 second backoff, keeping
//! the in-flight envelope until it goes out. The subscriber re-requests the
//! fleet state on every (re)connect, drops echoes of our own envelopes, and
//! dispatches the rest into the exchange.
//!
//! Ordering across the broker is best effort: events within one object
//! travel in a single envelope, but no cross-envelope order is guaranteed
//! to other processes.

use crate::error::Result;
use crate::event::KvEvent;
use crate::exchange::Exchange;
use crate::object::KvObject;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// The single broker channel shared by every Sapphire process
pub const BROKER_CHANNEL: &str = "sapphire_objects";

/// Backoff between broker reconnection attempts
const RETRY_DELAY: Duration = Duration::from_secs(4);

/// Wire form of every broker message
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    pub origin_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Running publisher/subscriber pair
pub struct Transport {
    shutdown: broadcast::Sender<()>,
    publisher: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

impl Transport {
    /// Attach a transport to the exchange and announce this process with an
    /// `origin` collection object.
    pub fn start(exchange: &Exchange, broker_url: &str) -> Result<Self> {
        let client = redis::Client::open(broker_url)?;

        let (tx, rx) = mpsc::unbounded_channel();
        exchange.attach_outbound(tx);

        let (shutdown, _) = broadcast::channel(1);

        let publisher = tokio::spawn(publisher_task(
            client.clone(),
            rx,
            shutdown.subscribe(),
        ));
        let subscriber = tokio::spawn(subscriber_task(
            exchange.clone(),
            client,
            shutdown.subscribe(),
        ));

        let origin_obj = KvObject::new(exchange.origin(), Some("origin"));
        let _ = origin_obj.set("hostname", Value::String(hostname()));
        exchange.publish(&origin_obj);

        Ok(Self {
            shutdown,
            publisher,
            subscriber,
        })
    }

    /// Unpublish our objects, drain the outbound queue, and stop both tasks.
    pub async fn stop(self, exchange: &Exchange) {
        exchange.unpublish_objects();

        // closing the queue lets the publisher drain what is buffered
        exchange.detach_outbound();
        let _ = self.shutdown.send(());

        let _ = self.publisher.await;
        let _ = self.subscriber.await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

async fn publisher_task(
    client: redis::Client,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("object publisher started");

    let mut conn: Option<redis::aio::MultiplexedConnection> = None;

    'queue: while let Some(msg) = rx.recv().await {
        // hold onto the envelope until the broker takes it
        loop {
            if conn.is_none() {
                match client.get_multiplexed_async_connection().await {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        info!("unable to connect to broker, retrying...");
                        debug!("broker connect error: {}", e);
                    }
                }
            }

            if let Some(c) = conn.as_mut() {
                match c.publish::<_, _, ()>(BROKER_CHANNEL, &msg).await {
                    Ok(()) => continue 'queue,
                    Err(e) => {
                        info!("broker publish failed, retrying...");
                        debug!("broker publish error: {}", e);
                        conn = None;
                    }
                }
            }

            tokio::select! {
                _ = sleep(RETRY_DELAY) => {}
                _ = shutdown.recv() => {
                    warn!("shutdown with broker unreachable, dropping queued envelopes");
                    break 'queue;
                }
            }
        }
    }

    info!("object publisher stopped");
}

async fn subscriber_task(
    exchange: Exchange,
    client: redis::Client,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("object subscriber started");

    'outer: loop {
        let mut pubsub = tokio::select! {
            result = client.get_async_pubsub() => match result {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    info!("unable to connect to broker, retrying...");
                    debug!("broker connect error: {}", e);
                    tokio::select! {
                        _ = sleep(RETRY_DELAY) => continue 'outer,
                        _ = shutdown.recv() => break 'outer,
                    }
                }
            },
            _ = shutdown.recv() => break 'outer,
        };

        if let Err(e) = pubsub.subscribe(BROKER_CHANNEL).await {
            info!("broker subscribe failed, retrying...");
            debug!("broker subscribe error: {}", e);
            tokio::select! {
                _ = sleep(RETRY_DELAY) => continue 'outer,
                _ = shutdown.recv() => break 'outer,
            }
        }

        // peers re-broadcast their sets so we catch up after (re)connect
        exchange.request_objects();

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break 'outer,
                msg = stream.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => handle_payload(&exchange, &payload),
                        Err(e) => warn!("undecodable broker message: {}", e),
                    },
                    None => {
                        info!("broker connection lost, retrying...");
                        break;
                    }
                },
            }
        }

        drop(stream);
        tokio::select! {
            _ = sleep(RETRY_DELAY) => {}
            _ = shutdown.recv() => break 'outer,
        }
    }

    info!("object subscriber stopped");
}

fn handle_payload(exchange: &Exchange, payload: &str) {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => handle_envelope(exchange, envelope),
        Err(e) => warn!("malformed envelope skipped: {}", e),
    }
}

/// Dispatch one inbound envelope into the exchange. Envelopes carrying our
/// own origin are echoes of our broadcasts and are dropped.
pub fn handle_envelope(exchange: &Exchange, envelope: Envelope) {
    if envelope.origin_id == exchange.origin().as_str() {
        return;
    }

    match envelope.method.as_str() {
        "publish" => {
            exchange.clear_catching_up();
            match envelope.data.as_object() {
                Some(map) => {
                    if let Err(e) = exchange.update(map) {
                        warn!("bad publish envelope skipped: {}", e);
                    }
                }
                None => warn!("publish envelope without object data"),
            }
        }

        "events" => match envelope.data.as_array() {
            Some(items) => {
                let mut events = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_object().map(KvEvent::from_map) {
                        Some(Ok(event)) => events.push(event),
                        Some(Err(e)) => warn!("bad event skipped: {}", e),
                        None => warn!("bad event skipped: not an object"),
                    }
                }
                exchange.receive_events(events);
            }
            None => warn!("events envelope without event list"),
        },

        "delete" => match envelope.data.get("object_id").and_then(Value::as_str) {
            Some(object_id) => exchange.delete_by_id(object_id),
            None => warn!("delete envelope without object_id"),
        },

        "request_objects" => {
            debug!("received request for objects");
            exchange.publish_objects();
        }

        other => warn!("unknown envelope method skipped: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::Origin;
    use crate::query::Query;
    use serde_json::json;

    fn publish_envelope(origin: &Origin, object_id: &str, k: i64) -> Envelope {
        Envelope {
            method: "publish".into(),
            origin_id: origin.as_str().to_string(),
            data: json!({
                "object_id": object_id,
                "origin_id": origin.as_str(),
                "collection": "c",
                "k": k,
            }),
        }
    }

    #[test]
    fn test_envelope_wire_form() {
        let envelope = Envelope {
            method: "delete".into(),
            origin_id: "abc".into(),
            data: json!({"object_id": "o1"}),
        };

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.method, "delete");
        assert_eq!(decoded.origin_id, "abc");
        assert_eq!(decoded.data["object_id"], json!("o1"));

        // data may be omitted entirely (request_objects)
        let decoded: Envelope =
            serde_json::from_str(r#"{"method":"request_objects","origin_id":"x"}"#).unwrap();
        assert_eq!(decoded.data, Value::Null);
    }

    #[test]
    fn test_own_origin_suppressed() {
        let exchange = Exchange::new();

        let envelope = publish_envelope(exchange.origin(), "o1", 1);
        handle_envelope(&exchange, envelope);

        assert!(exchange.get("o1").is_none());
    }

    #[test]
    fn test_remote_publish_applied() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        exchange.request_objects();
        assert!(exchange.catching_up());

        handle_envelope(&exchange, publish_envelope(&remote, "o1", 1));

        assert_eq!(exchange.get("o1").unwrap().get("k"), Some(json!(1)));
        // first remote publish ends the catch-up window
        assert!(!exchange.catching_up());
    }

    #[test]
    fn test_remote_events_applied() {
        let exchange = Exchange::new();
        let remote = Origin::generate();
        handle_envelope(&exchange, publish_envelope(&remote, "o1", 1));

        let event = KvEvent::new("o1", "k", json!(2), &remote);
        handle_envelope(
            &exchange,
            Envelope {
                method: "events".into(),
                origin_id: remote.as_str().to_string(),
                data: json!([Value::Object(event.to_map())]),
            },
        );

        assert_eq!(exchange.get("o1").unwrap().get("k"), Some(json!(2)));
    }

    #[test]
    fn test_remote_delete() {
        let exchange = Exchange::new();
        let remote = Origin::generate();
        handle_envelope(&exchange, publish_envelope(&remote, "o1", 1));

        handle_envelope(
            &exchange,
            Envelope {
                method: "delete".into(),
                origin_id: remote.as_str().to_string(),
                data: json!({"object_id": "o1"}),
            },
        );

        assert!(exchange.get("o1").is_none());
    }

    #[test]
    fn test_request_objects_republishes() {
        let exchange = Exchange::new();
        let obj = KvObject::with_id(exchange.origin(), "mine", Some("c"));
        exchange.publish(&obj);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        exchange.attach_outbound(tx);

        let remote = Origin::generate();
        handle_envelope(
            &exchange,
            Envelope {
                method: "request_objects".into(),
                origin_id: remote.as_str().to_string(),
                data: Value::Null,
            },
        );

        let envelope: Envelope = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope.method, "publish");
        assert_eq!(envelope.data["object_id"], json!("mine"));
    }

    #[test]
    fn test_malformed_envelopes_skipped() {
        let exchange = Exchange::new();
        let remote = Origin::generate();

        handle_payload(&exchange, "not json at all");
        handle_envelope(
            &exchange,
            Envelope {
                method: "frobnicate".into(),
                origin_id: remote.as_str().to_string(),
                data: Value::Null,
            },
        );
        handle_envelope(
            &exchange,
            Envelope {
                method: "events".into(),
                origin_id: remote.as_str().to_string(),
                data: json!([{"bogus": true}]),
            },
        );

        assert!(exchange.query(&Query::all()).is_empty());
    }
}
