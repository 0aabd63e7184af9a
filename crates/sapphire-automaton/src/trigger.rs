//! Rule triggers
//!
//! A trigger is a predicate over a received event, optionally gated by a
//! source query: the event's object must be in the query's result set
//! before the condition even runs. Interval triggers match the synthetic
//! events the scheduler fires for them.

use crate::scheduler::{Scheduler, INTERVAL_TRIGGER_KEY};
use sapphire_core::{EventRef, Exchange, Query};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub trait Trigger: Send + Sync {
    /// Called once at rule setup, after actions are initialized
    fn init(&self, _scheduler: &Scheduler) {}

    /// Restrict firing to events on objects matching this query
    fn source(&self) -> Option<&Query> {
        None
    }

    fn condition(&self, event: &EventRef) -> bool;

    fn eval(&self, exchange: &Exchange, event: &EventRef) -> bool {
        if let Some(source) = self.source() {
            let matched = exchange
                .query(source)
                .iter()
                .any(|o| o.object_id() == event.event.object_id);
            if !matched {
                return false;
            }
        }

        self.condition(event)
    }
}

/// Fires on assignments of a key, optionally to one specific value
pub struct AttrTrigger {
    key: String,
    value: Option<Value>,
    source: Option<Query>,
}

impl AttrTrigger {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            source: None,
        }
    }

    /// Require the assigned value to equal this one
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn source(mut self, query: Query) -> Self {
        self.source = Some(query);
        self
    }
}

impl Trigger for AttrTrigger {
    fn source(&self) -> Option<&Query> {
        self.source.as_ref()
    }

    fn condition(&self, event: &EventRef) -> bool {
        if event.event.key != self.key {
            return false;
        }

        match &self.value {
            Some(value) => &event.event.value == value,
            None => true,
        }
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Fires at a fixed period, driven by the scheduler
pub struct IntervalTrigger {
    period: Duration,
    run_now: bool,
    run_once: bool,
    token: u64,
}

impl IntervalTrigger {
    pub fn new() -> Self {
        Self {
            period: Duration::ZERO,
            run_now: false,
            run_once: false,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn weeks(self, weeks: u64) -> Self {
        self.plus(Duration::from_secs(weeks * 7 * 24 * 3600))
    }

    pub fn days(self, days: u64) -> Self {
        self.plus(Duration::from_secs(days * 24 * 3600))
    }

    pub fn hours(self, hours: u64) -> Self {
        self.plus(Duration::from_secs(hours * 3600))
    }

    pub fn minutes(self, minutes: u64) -> Self {
        self.plus(Duration::from_secs(minutes * 60))
    }

    pub fn seconds(self, seconds: u64) -> Self {
        self.plus(Duration::from_secs(seconds))
    }

    fn plus(mut self, d: Duration) -> Self {
        self.period += d;
        self
    }

    /// Fire once immediately at setup
    pub fn run_now(mut self) -> Self {
        self.run_now = true;
        self
    }

    /// Unschedule after the first firing
    pub fn run_once(mut self) -> Self {
        self.run_once = true;
        self
    }
}

impl Default for IntervalTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for IntervalTrigger {
    fn init(&self, scheduler: &Scheduler) {
        scheduler.add_job(self.period, self.run_now, self.run_once, self.token);
    }

    fn condition(&self, event: &EventRef) -> bool {
        event.event.key == INTERVAL_TRIGGER_KEY && event.event.value == json!(self.token)
    }
}
