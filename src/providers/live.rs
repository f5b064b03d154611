//! Live providers - Blocking bridges onto the async exchange client
//!
//! Algorithms run on blocking threads; every call here parks that thread on
//! the tokio runtime via `Handle::block_on`.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{DataProvider, OrderExecutor, check_candle_count, performance, window_start};
use crate::algorithm::RuntimeEvent;
use crate::core::{
    AlgorithmId, Candle, Error, ExchangeClient, OrderSide, OrderStatus, OrderUpdate, Result, TradingPair,
};

/// Attempts per order placement before the error is surfaced
const MAX_PLACEMENT_ATTEMPTS: usize = 5;

pub struct LiveDataProvider {
    client: Arc<dyn ExchangeClient>,
    handle: Handle,
    candle_width: TimeDelta,
}

impl LiveDataProvider {
    pub fn new(client: Arc<dyn ExchangeClient>, handle: Handle, candle_width: TimeDelta) -> Self {
        Self {
            client,
            handle,
            candle_width,
        }
    }
}

impl DataProvider for LiveDataProvider {
    fn current_price_last_trade(&self, pair: &TradingPair) -> Result<Decimal> {
        Ok(self.handle.block_on(self.client.fetch_ticker(pair))?.last)
    }

    fn current_price_top_bid(&self, pair: &TradingPair) -> Result<Decimal> {
        Ok(self.handle.block_on(self.client.fetch_ticker(pair))?.bid)
    }

    fn current_price_top_ask(&self, pair: &TradingPair) -> Result<Decimal> {
        Ok(self.handle.block_on(self.client.fetch_ticker(pair))?.ask)
    }

    fn performance_past_hours(
        &self,
        pair: &TradingPair,
        hours_back: f64,
        end_time: DateTime<Utc>,
    ) -> Result<Decimal> {
        let start = window_start(end_time, hours_back)?;
        let candles = self
            .handle
            .block_on(self.client.fetch_candles(pair, start, end_time))?;
        performance(pair, &candles)
    }

    fn candles(&self, pair: &TradingPair, count: usize) -> Result<Vec<Candle>> {
        check_candle_count(count)?;
        let now = Utc::now();
        // One extra width covers the candle that is still open
        let span = i32::try_from(count)
            .ok()
            .and_then(|n| n.checked_add(1))
            .and_then(|n| self.candle_width.checked_mul(n))
            .and_then(|span| now.checked_sub_signed(span))
            .ok_or_else(|| Error::InvalidArgument(format!("{} candles reach too far back", count)))?;

        let fetched = self.handle.block_on(self.client.fetch_candles(pair, span, now))?;
        let closed: Vec<Candle> = fetched
            .into_iter()
            .filter(|c| c.close_time(self.candle_width) <= now)
            .collect();
        if closed.len() < count {
            return Err(Error::Communication(format!(
                "requested {} {} candles but received {}",
                count,
                pair,
                closed.len()
            )));
        }
        Ok(closed.into_iter().rev().take(count).collect())
    }
}

pub struct LiveOrderExecutor {
    client: Arc<dyn ExchangeClient>,
    handle: Handle,
}

impl LiveOrderExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, handle: Handle) -> Self {
        Self { client, handle }
    }
}

impl LiveOrderExecutor {
    fn with_retries<F, Fut>(&self, pair: &TradingPair, side: OrderSide, quantity: Decimal, place: F) -> Result<OrderUpdate>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<OrderUpdate>>,
    {
        let mut attempt = 1;
        loop {
            match self.handle.block_on(place()) {
                Ok(order) => return Ok(order),
                Err(e) if attempt < MAX_PLACEMENT_ATTEMPTS => {
                    warn!(%pair, %side, %quantity, "{} - attempt {}/{}", e, attempt, MAX_PLACEMENT_ATTEMPTS);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl OrderExecutor for LiveOrderExecutor {
    fn execute_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderUpdate> {
        self.with_retries(pair, side, quantity, || {
            self.client.place_market_order(pair, side, quantity)
        })
    }

    fn execute_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate> {
        self.with_retries(pair, side, quantity, || {
            self.client.place_limit_order(pair, side, quantity, price)
        })
    }

    fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate> {
        self.handle.block_on(self.client.cancel_order(pair, order_id))
    }
}

/// Orders whose updates are parked while no owner is known
const MAX_PARKED_ORDERS: usize = 256;

#[derive(Debug, Default)]
struct Routes {
    owners: HashMap<u64, AlgorithmId>,
    inboxes: HashMap<AlgorithmId, flume::Sender<RuntimeEvent>>,
    parked: HashMap<u64, Vec<OrderUpdate>>,
    parked_order: VecDeque<u64>,
}

impl Routes {
    fn deliver(&mut self, algorithm: &AlgorithmId, update: &OrderUpdate) -> bool {
        if is_terminal(update.status) {
            self.owners.remove(&update.order_id);
        }
        let Some(inbox) = self.inboxes.get(algorithm) else {
            debug!(%algorithm, order_id = update.order_id, "Order update for stopped algorithm");
            return false;
        };
        if inbox.send(RuntimeEvent::OrderUpdate(Some(update.clone()))).is_err() {
            warn!(%algorithm, order_id = update.order_id, "Order update dropped, algorithm stopped");
            return false;
        }
        true
    }

    fn park(&mut self, update: &OrderUpdate) {
        if !self.parked.contains_key(&update.order_id) {
            if self.parked_order.len() == MAX_PARKED_ORDERS {
                if let Some(oldest) = self.parked_order.pop_front() {
                    self.parked.remove(&oldest);
                }
            }
            self.parked_order.push_back(update.order_id);
        }
        self.parked.entry(update.order_id).or_default().push(update.clone());
    }
}

fn is_terminal(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
    )
}

/// Maps exchange order ids to the algorithm that placed them and delivers their updates.
///
/// An update that arrives before its order is registered is parked and
/// replayed, in arrival order, once the placing algorithm registers it.
#[derive(Debug, Clone, Default)]
pub struct OrderRouter {
    routes: Arc<Mutex<Routes>>,
}

impl OrderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that receives the updates of `algorithm`'s orders
    pub fn attach(&self, algorithm: AlgorithmId, inbox: flume::Sender<RuntimeEvent>) {
        self.routes.lock().inboxes.insert(algorithm, inbox);
    }

    pub fn detach(&self, algorithm: &AlgorithmId) {
        let mut routes = self.routes.lock();
        routes.inboxes.remove(algorithm);
        routes.owners.retain(|_, owner| owner != algorithm);
    }

    pub fn register(&self, order_id: u64, algorithm: AlgorithmId) {
        debug!(order_id, %algorithm, "Routing order");
        let mut routes = self.routes.lock();
        routes.owners.insert(order_id, algorithm.clone());

        let Some(parked) = routes.parked.remove(&order_id) else {
            return;
        };
        routes.parked_order.retain(|id| *id != order_id);
        debug!(order_id, %algorithm, updates = parked.len(), "Replaying parked order updates");
        for update in &parked {
            routes.deliver(&algorithm, update);
        }
    }

    pub fn forget(&self, order_id: u64) {
        self.routes.lock().owners.remove(&order_id);
    }

    /// Owner of the order; terminal updates drop the route afterwards
    pub fn route(&self, update: &OrderUpdate) -> Option<AlgorithmId> {
        let mut routes = self.routes.lock();
        if is_terminal(update.status) {
            routes.owners.remove(&update.order_id)
        } else {
            routes.owners.get(&update.order_id).cloned()
        }
    }

    /// Deliver to the owner's queue, or park until the owner registers the order
    pub fn dispatch(&self, update: &OrderUpdate) -> bool {
        let mut routes = self.routes.lock();
        match routes.owners.get(&update.order_id).cloned() {
            Some(owner) => routes.deliver(&owner, update),
            None => {
                debug!(order_id = update.order_id, "Order update without owner, parked");
                routes.park(update);
                false
            }
        }
    }
}
