//! State machine runtime - Drives one algorithm through its states
//!
//! The runtime is the single consumer of the algorithm's event queue, so
//! handlers for one algorithm never overlap. A failing or panicking handler
//! halts this algorithm only; later events are dropped.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

use super::state::{RuntimeEvent, State, StateContext, Transition};
use crate::core::{AlgorithmId, Error, Exchange, Result, RunMode};
use crate::providers::{DataProvider, TradingProvider};
use crate::timer::TimerProvider;

/// One recorded state switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSwitch {
    pub timestamp: DateTime<Utc>,
    pub algorithm: AlgorithmId,
    pub from: String,
    pub to: String,
}

/// Externally visible state of a runtime
#[derive(Debug)]
pub struct RuntimeStatus {
    halted: AtomicBool,
    state: Mutex<&'static str>,
    order_updates: AtomicU64,
}

impl RuntimeStatus {
    fn new() -> Self {
        Self {
            halted: AtomicBool::new(false),
            state: Mutex::new("-"),
            order_updates: AtomicU64::new(0),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> &'static str {
        *self.state.lock()
    }

    /// Order updates handed to a state so far
    pub fn order_updates(&self) -> u64 {
        self.order_updates.load(Ordering::SeqCst)
    }
}

/// Collaborators handed to a runtime at construction
pub struct RuntimeServices {
    pub algorithm: AlgorithmId,
    pub exchange: Exchange,
    pub mode: RunMode,
    pub trading: TradingProvider,
    pub data: Arc<dyn DataProvider>,
    pub timer: Arc<dyn TimerProvider>,
}

/// Type-erased runtime so algorithms with different settings share one engine
pub trait AlgorithmRuntime: Send {
    fn algorithm(&self) -> &AlgorithmId;

    fn exchange(&self) -> &Exchange;

    fn sender(&self) -> flume::Sender<RuntimeEvent>;

    fn status(&self) -> Arc<RuntimeStatus>;

    /// Activate the initial state
    fn start(&mut self) -> Result<()>;

    fn handle(&mut self, event: RuntimeEvent) -> Result<()>;

    /// Handle every queued event, including ones enqueued while handling
    fn drain(&mut self) -> Result<usize>;

    /// Block on the queue until shutdown, disconnect or halt
    fn run_blocking(&mut self);

    fn switches(&self) -> &[StateSwitch];
}

pub struct StateMachine<S> {
    ctx: StateContext<S>,
    exchange: Exchange,
    initial: Option<Box<dyn State<S>>>,
    active: Option<Box<dyn State<S>>>,
    events: flume::Receiver<RuntimeEvent>,
    sender: flume::Sender<RuntimeEvent>,
    status: Arc<RuntimeStatus>,
    switches: Vec<StateSwitch>,
}

impl<S: Send + 'static> StateMachine<S> {
    pub fn new(settings: S, initial: Box<dyn State<S>>, services: RuntimeServices) -> Self {
        let (sender, events) = flume::unbounded();
        let ctx = StateContext::new(
            services.algorithm,
            services.mode,
            settings,
            services.trading,
            services.data,
            services.timer,
            sender.clone(),
        );
        Self {
            ctx,
            exchange: services.exchange,
            initial: Some(initial),
            active: None,
            events,
            sender,
            status: Arc::new(RuntimeStatus::new()),
            switches: Vec::new(),
        }
    }

    pub fn context(&self) -> &StateContext<S> {
        &self.ctx
    }

    pub fn current_state(&self) -> Option<&'static str> {
        self.active.as_ref().map(|s| s.name())
    }

    pub fn is_halted(&self) -> bool {
        self.status.is_halted()
    }

    fn halt(&self, from: &str, to: &str, err: &Error) {
        error!(
            algorithm = %self.ctx.algorithm(),
            from, to,
            "Algorithm halted: {}", err
        );
        self.status.halted.store(true, Ordering::SeqCst);
        self.ctx.stop_timer();
    }

    /// Run `f` against the context, turning panics into logic errors
    fn guarded<T>(&self, f: impl FnOnce(&StateContext<S>) -> Result<T>) -> Result<T> {
        let ctx = &self.ctx;
        match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::AlgorithmLogic(format!("handler panicked: {}", message)))
            }
        }
    }

    /// Follow switches until a state's entry logic stays
    fn apply(&mut self, mut transition: Transition<S>) -> Result<()> {
        while let Transition::Switch(mut next) = transition {
            let from = self.current_state().unwrap_or("-");
            let to = next.name();

            self.ctx.stop_timer();
            let now = self.ctx.now();
            info!(algorithm = %self.ctx.algorithm(), "STATE SWITCH: {} ---> {} at {}", from, to, now);
            self.switches.push(StateSwitch {
                timestamp: now,
                algorithm: self.ctx.algorithm().clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
            *self.status.state.lock() = to;

            let entered = self.guarded(|ctx| next.run(ctx));
            self.active = Some(next);
            transition = match entered {
                Ok(t) => t,
                Err(e) => {
                    self.halt(from, to, &e);
                    return Err(e);
                }
            };
        }
        Ok(())
    }

    fn dispatch(&mut self, event: RuntimeEvent) -> Result<()> {
        let Some(mut state) = self.active.take() else {
            return Err(Error::AlgorithmLogic(format!(
                "algorithm {} received an event before start",
                self.ctx.algorithm()
            )));
        };

        let result = match &event {
            RuntimeEvent::MarketTick => self.guarded(|ctx| state.on_market_condition(ctx)),
            RuntimeEvent::OrderUpdate(None) => Ok(Transition::Stay),
            RuntimeEvent::OrderUpdate(Some(update)) => {
                self.status.order_updates.fetch_add(1, Ordering::SeqCst);
                self.guarded(|ctx| state.on_order_update(update, ctx))
            }
            RuntimeEvent::TimerElapsed(token) => {
                if self.ctx.take_timer(*token) {
                    self.guarded(|ctx| state.on_timer_elapsed(ctx))
                } else {
                    Ok(Transition::Stay)
                }
            }
            RuntimeEvent::Shutdown => Ok(Transition::Stay),
        };
        let name = state.name();
        self.active = Some(state);

        match result {
            Ok(transition) => self.apply(transition),
            Err(e) => {
                self.halt(name, "-", &e);
                Err(e)
            }
        }
    }
}

impl<S: Send + 'static> AlgorithmRuntime for StateMachine<S> {
    fn algorithm(&self) -> &AlgorithmId {
        self.ctx.algorithm()
    }

    fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    fn sender(&self) -> flume::Sender<RuntimeEvent> {
        self.sender.clone()
    }

    fn status(&self) -> Arc<RuntimeStatus> {
        Arc::clone(&self.status)
    }

    fn start(&mut self) -> Result<()> {
        let initial = self.initial.take().ok_or_else(|| {
            Error::AlgorithmLogic(format!("algorithm {} already started", self.ctx.algorithm()))
        })?;
        debug!(algorithm = %self.ctx.algorithm(), state = initial.name(), "Activating initial state");
        self.apply(Transition::Switch(initial))
    }

    fn handle(&mut self, event: RuntimeEvent) -> Result<()> {
        if self.is_halted() {
            return Err(Error::Halted(self.ctx.algorithm().clone()));
        }
        self.dispatch(event)
    }

    fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn run_blocking(&mut self) {
        while let Ok(event) = self.events.recv() {
            if matches!(event, RuntimeEvent::Shutdown) {
                break;
            }
            if self.handle(event).is_err() && self.is_halted() {
                break;
            }
        }
        self.ctx.stop_timer();
        info!(algorithm = %self.ctx.algorithm(), "Algorithm runtime stopped");
    }

    fn switches(&self) -> &[StateSwitch] {
        &self.switches
    }
}
