//! States - Behaviour units of an algorithm and the context they run in

use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::core::{AlgorithmId, Error, OrderUpdate, Result, RunMode};
use crate::providers::{DataProvider, TradingProvider};
use crate::timer::{TimerProvider, check_duration};

/// Result of a handler: remain in the active state or switch to a new one
pub enum Transition<S> {
    Stay,
    Switch(Box<dyn State<S>>),
}

impl<S> Transition<S> {
    pub fn to(state: impl State<S> + 'static) -> Self {
        Transition::Switch(Box::new(state))
    }

    pub fn is_stay(&self) -> bool {
        matches!(self, Transition::Stay)
    }
}

impl<S> std::fmt::Debug for Transition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Stay => write!(f, "Stay"),
            Transition::Switch(next) => write!(f, "Switch({})", next.name()),
        }
    }
}

/// A named behaviour of one algorithm.
///
/// `run` is the entry logic, invoked once when the runtime switches in.
/// Timer and order-update handlers must be overridden by any state that
/// arms a timer or places orders; unhandled events are a logic error when
/// backtesting.
pub trait State<S>: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &StateContext<S>) -> Result<Transition<S>>;

    fn on_market_condition(&mut self, _ctx: &StateContext<S>) -> Result<Transition<S>> {
        Ok(Transition::Stay)
    }

    fn on_order_update(&mut self, _update: &OrderUpdate, ctx: &StateContext<S>) -> Result<Transition<S>> {
        ctx.unhandled(self.name(), "order update")
    }

    fn on_timer_elapsed(&mut self, ctx: &StateContext<S>) -> Result<Transition<S>> {
        ctx.unhandled(self.name(), "timer")
    }
}

/// Events delivered to an algorithm's runtime, in FIFO order
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Evaluate market conditions
    MarketTick,
    /// Order-fill event; `None` always means stay
    OrderUpdate(Option<OrderUpdate>),
    /// Timer armed with this token elapsed
    TimerElapsed(u64),
    /// Leave the event loop
    Shutdown,
}

/// Everything a state may touch: settings, providers and its timer
pub struct StateContext<S> {
    algorithm: AlgorithmId,
    mode: RunMode,
    settings: S,
    trading: TradingProvider,
    data: Arc<dyn DataProvider>,
    timer: Arc<dyn TimerProvider>,
    events: flume::Sender<RuntimeEvent>,
    next_token: Cell<u64>,
    pending: Cell<Option<u64>>,
}

impl<S> StateContext<S> {
    pub(crate) fn new(
        algorithm: AlgorithmId,
        mode: RunMode,
        settings: S,
        trading: TradingProvider,
        data: Arc<dyn DataProvider>,
        timer: Arc<dyn TimerProvider>,
        events: flume::Sender<RuntimeEvent>,
    ) -> Self {
        Self {
            algorithm,
            mode,
            settings,
            trading,
            data,
            timer,
            events,
            next_token: Cell::new(0),
            pending: Cell::new(None),
        }
    }

    pub fn algorithm(&self) -> &AlgorithmId {
        &self.algorithm
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn trading(&self) -> &TradingProvider {
        &self.trading
    }

    pub fn data(&self) -> &dyn DataProvider {
        self.data.as_ref()
    }

    /// Current time of this algorithm's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.timer.current_time()
    }

    /// Arm the algorithm's timer, replacing any pending one
    pub fn set_timer(&self, duration: chrono::Duration) -> Result<()> {
        check_duration(duration)?;

        let token = self.next_token.get() + 1;
        self.next_token.set(token);
        self.pending.set(Some(token));

        let events = self.events.clone();
        let armed = self.timer.set_timer(
            duration,
            Box::new(move || {
                let _ = events.send(RuntimeEvent::TimerElapsed(token));
            }),
        );
        if armed.is_err() {
            self.pending.set(None);
        }
        armed
    }

    pub fn stop_timer(&self) {
        if self.pending.take().is_some() {
            self.timer.stop_timer();
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.pending.get().is_some()
    }

    /// Consume the pending token if `token` is still the live one
    pub(crate) fn take_timer(&self, token: u64) -> bool {
        if self.pending.get() == Some(token) {
            self.pending.set(None);
            true
        } else {
            trace!(algorithm = %self.algorithm, token, "Ignoring stale timer");
            false
        }
    }

    /// Fallback for events a state does not handle
    pub fn unhandled(&self, state: &str, event: &str) -> Result<Transition<S>> {
        match self.mode {
            RunMode::Live => {
                debug!(algorithm = %self.algorithm, state, event, "Event not handled by state");
                Ok(Transition::Stay)
            }
            RunMode::Backtest => Err(Error::AlgorithmLogic(format!(
                "state {} of algorithm {} does not handle {} events",
                state, self.algorithm, event
            ))),
        }
    }
}
