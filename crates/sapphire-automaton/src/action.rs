//! Rule actions
//!
//! An action is the unit of work a rule dispatches when a trigger fires.
//! The default run sequence is `pre`, `action`, `post`; targeted actions
//! re-run their object query per firing and invoke the work once per
//! matched object, skipping the whole sequence when the query comes up
//! empty.

use sapphire_core::{EventRef, Exchange, KvObject, Query};
use std::sync::Arc;
use tracing::info;

pub trait Action: Send + Sync {
    fn init(&self) {}

    fn pre(&self, _event: &EventRef) {}

    fn action(&self, _event: &EventRef) {}

    fn post(&self, _event: &EventRef) {}

    fn run(&self, event: &EventRef) {
        self.pre(event);
        self.action(event);
        self.post(event);
    }
}

/// Plain closure action
pub struct FnAction<F: Fn(&EventRef) + Send + Sync>(pub F);

impl<F: Fn(&EventRef) + Send + Sync> Action for FnAction<F> {
    fn action(&self, event: &EventRef) {
        (self.0)(event);
    }
}

/// An action applied to every object matching a query, re-evaluated on
/// each firing.
pub struct TargetAction<F: Fn(&EventRef, &Arc<KvObject>) + Send + Sync> {
    exchange: Exchange,
    targets: Query,
    work: F,
}

impl<F: Fn(&EventRef, &Arc<KvObject>) + Send + Sync> TargetAction<F> {
    pub fn new(exchange: Exchange, targets: Query, work: F) -> Self {
        Self {
            exchange,
            targets,
            work,
        }
    }
}

impl<F: Fn(&EventRef, &Arc<KvObject>) + Send + Sync> Action for TargetAction<F> {
    fn run(&self, event: &EventRef) {
        let targets = self.exchange.query(&self.targets);

        if targets.is_empty() {
            info!("target query returned no objects");
            return;
        }

        self.pre(event);
        for target in &targets {
            (self.work)(event, target);
        }
        self.post(event);
    }
}
