//! Rules and the automaton runtime
//!
//! A rule owns a set of triggers and a set of actions. On each received
//! event the triggers are evaluated in declaration order; the first hit
//! dispatches every action, each guarded by an already-running flag so a
//! slow action is never run concurrently with itself. Setup initializes
//! actions before triggers so interval triggers with `run_now` fire
//! against initialized actions.
//!
//! A failing trigger or action is logged and never stops evaluation for
//! the other triggers, actions, or rules in the process.

use crate::action::Action;
use crate::scheduler::Scheduler;
use crate::trigger::Trigger;
use parking_lot::Mutex;
use sapphire_core::{EventRef, Exchange, Signal};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct Rule {
    triggers: Vec<Arc<dyn Trigger>>,
    actions: Vec<ActionSlot>,
}

struct ActionSlot {
    action: Arc<dyn Action>,
    running: Arc<AtomicBool>,
}

impl Rule {
    pub fn new() -> Self {
        Self {
            triggers: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn trigger(mut self, trigger: impl Trigger + 'static) -> Self {
        self.triggers.push(Arc::new(trigger));
        self
    }

    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(ActionSlot {
            action: Arc::new(action),
            running: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    fn setup(&self, scheduler: &Scheduler) {
        for slot in &self.actions {
            slot.action.init();
        }

        // triggers last: run_now interval triggers fire during init
        for trigger in &self.triggers {
            trigger.init(scheduler);
        }
    }

    /// Evaluate one event. The first matching trigger dispatches every
    /// action that is not still busy from an earlier firing. A trigger
    /// that fails is logged and skipped; an action that fails is logged
    /// and its slot freed for the next firing.
    fn run(&self, exchange: &Exchange, event: &EventRef) {
        for trigger in &self.triggers {
            let hit = match catch_unwind(AssertUnwindSafe(|| trigger.eval(exchange, event))) {
                Ok(hit) => hit,
                Err(_) => {
                    error!("trigger failed evaluating {}", event.event.key);
                    continue;
                }
            };

            if !hit {
                continue;
            }

            debug!("rule triggered by {}", event.event.key);

            for slot in &self.actions {
                if slot.running.swap(true, Ordering::SeqCst) {
                    debug!("action already running, skipped");
                    continue;
                }

                let action = slot.action.clone();
                let running = slot.running.clone();
                let event = event.clone();

                tokio::spawn(async move {
                    let result = catch_unwind(AssertUnwindSafe(|| action.run(&event)));

                    // the slot frees whatever happened to the action
                    running.store(false, Ordering::SeqCst);

                    if result.is_err() {
                        error!("action failed handling {}", event.event.key);
                    }
                });
            }

            // only one trigger fires per event
            return;
        }
    }
}

impl Default for Rule {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopped,
}

/// The rule engine: consumes received events from the dispatcher and
/// evaluates every rule against each one.
pub struct Automaton {
    exchange: Exchange,
    rules: Vec<Arc<Rule>>,
    scheduler: Arc<Scheduler>,
    state: Arc<Mutex<RunState>>,
    worker: Option<JoinHandle<()>>,
}

impl Automaton {
    pub fn new(exchange: Exchange) -> Self {
        let scheduler = Arc::new(Scheduler::new(exchange.clone()));
        Self {
            exchange,
            rules: Vec::new(),
            scheduler,
            state: Arc::new(Mutex::new(RunState::Stopped)),
            worker: None,
        }
    }

    /// Register a rule; rules are fixed once the engine starts.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(Arc::new(rule));
    }

    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        info!("automaton starting with {} rules", self.rules.len());
        *self.state.lock() = RunState::Running;

        let (tx, mut rx) = mpsc::unbounded_channel::<EventRef>();
        self.exchange
            .dispatcher()
            .connect(Signal::ReceivedEvent, move |event| {
                let _ = tx.send(event.clone());
            });

        let rules = self.rules.clone();
        let exchange = self.exchange.clone();
        let state = self.state.clone();

        self.worker = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match *state.lock() {
                    RunState::Running => {}
                    RunState::Paused => continue,
                    RunState::Stopped => break,
                }

                for rule in &rules {
                    rule.run(&exchange, &event);
                }
            }
        }));

        // setup after the worker listens so run_now firings are consumed
        for rule in &self.rules {
            rule.setup(&self.scheduler);
        }
    }

    /// Suspend evaluation; events arriving while paused are discarded.
    pub fn pause(&self) {
        info!("automaton paused");
        *self.state.lock() = RunState::Paused;
    }

    pub fn resume(&self) {
        info!("automaton resumed");
        *self.state.lock() = RunState::Running;
    }

    /// Tear down the scheduler and the evaluation worker.
    pub fn stop(&mut self) {
        info!("automaton stopped");
        *self.state.lock() = RunState::Stopped;
        self.scheduler.shutdown();

        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl Drop for Automaton {
    fn drop(&mut self) {
        self.stop();
    }
}
