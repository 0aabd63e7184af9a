//! Interval scheduler
//!
//! Fires synthetic events into the local dispatcher at fixed periods.
//! Interval triggers match the events back by a per-trigger token. The
//! synthetic key starts with an underscore, keeping these events off the
//! long-poll bus.

use parking_lot::Mutex;
use sapphire_core::{EventRef, Exchange, KvEvent, Signal};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

/// Key carried by scheduler-generated events
pub const INTERVAL_TRIGGER_KEY: &str = "__interval_trigger";

pub struct Scheduler {
    exchange: Exchange,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Schedule periodic firings of the token. `run_now` fires once
    /// immediately; `run_once` stops after the first firing.
    pub fn add_job(&self, period: Duration, run_now: bool, run_once: bool, token: u64) {
        if period.is_zero() && !run_now {
            warn!("interval job with zero period never fires");
            return;
        }

        let exchange = self.exchange.clone();

        let handle = tokio::spawn(async move {
            if run_now {
                fire(&exchange, token);
                if run_once {
                    return;
                }
            }

            if period.is_zero() {
                return;
            }

            loop {
                sleep(period).await;
                fire(&exchange, token);

                if run_once {
                    return;
                }
            }
        });

        self.jobs.lock().push(handle);
    }

    pub fn shutdown(&self) {
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fire(exchange: &Exchange, token: u64) {
    let event = KvEvent::new("", INTERVAL_TRIGGER_KEY, json!(token), exchange.origin());
    exchange
        .dispatcher()
        .send(Signal::ReceivedEvent, &EventRef::detached(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_exchange() -> (Exchange, Arc<AtomicUsize>) {
        let exchange = Exchange::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        exchange.dispatcher().connect(Signal::ReceivedEvent, move |ev| {
            if ev.event.key == INTERVAL_TRIGGER_KEY {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        (exchange, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_firing() {
        let (exchange, count) = counting_exchange();
        let scheduler = Scheduler::new(exchange);

        scheduler.add_job(Duration::from_secs(1), true, false, 7);

        tokio::time::sleep(Duration::from_millis(5100)).await;
        scheduler.shutdown();

        // one immediate firing plus five ticks
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_unschedules() {
        let (exchange, count) = counting_exchange();
        let scheduler = Scheduler::new(exchange);

        scheduler.add_job(Duration::from_secs(1), false, true, 7);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_and_once() {
        let (exchange, count) = counting_exchange();
        let scheduler = Scheduler::new(exchange);

        scheduler.add_job(Duration::from_secs(1), true, true, 7);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
