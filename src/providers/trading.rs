//! Allocation-scoped trading provider

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::live::OrderRouter;
use super::{DataProvider, OrderExecutor};
use crate::allocation::WeakAllocationManager;
use crate::core::{
    AlgorithmId, Balance, Error, OrderSide, OrderStatus, OrderUpdate, Portfolio, Result,
    TradeExecution, TradeProposal, TradingPair,
};

/// Places orders on behalf of one algorithm, spending only its own allocation
pub struct TradingProvider {
    executor: Arc<dyn OrderExecutor>,
    data: Arc<dyn DataProvider>,
    allocation: WeakAllocationManager,
    router: Option<OrderRouter>,
}

impl TradingProvider {
    pub fn new(
        executor: Arc<dyn OrderExecutor>,
        data: Arc<dyn DataProvider>,
        allocation: WeakAllocationManager,
        router: Option<OrderRouter>,
    ) -> Self {
        Self {
            executor,
            data,
            allocation,
            router,
        }
    }

    pub fn algorithm(&self) -> &AlgorithmId {
        self.allocation.algorithm()
    }

    /// The algorithm's current sub-portfolio
    pub fn portfolio(&self) -> Result<Portfolio> {
        self.allocation.get_all_funds()
    }

    /// Trade the full free balance of the sold currency (quote on buy, base on sell).
    ///
    /// Returns `None` when the proposal is refused or rounds to nothing.
    pub fn place_full_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
    ) -> Result<Option<OrderUpdate>> {
        let (sold, price) = match side {
            OrderSide::Buy => (&pair.right, self.data.current_price_top_ask(pair)?),
            OrderSide::Sell => (&pair.left, self.data.current_price_top_bid(pair)?),
        };
        let funds = self.allocation.get_available_funds(sold)?;

        let quantity = match side {
            OrderSide::Buy => match funds.free.checked_div(price) {
                Some(q) => pair.round_to_tradable(q),
                None => Decimal::ZERO,
            },
            OrderSide::Sell => pair.round_to_tradable(funds.free),
        };
        if quantity.is_zero() {
            debug!(algorithm = %self.algorithm(), %pair, %side, funds = %funds, "Nothing to trade");
            return Ok(None);
        }

        let amount = match side {
            OrderSide::Buy => quantity * price,
            OrderSide::Sell => quantity,
        };
        let proposal = TradeProposal::new(Balance::new(sold.clone(), amount, Decimal::ZERO))?;

        let mut placed = None;
        let accepted = self.allocation.queue_trade(&proposal, |_| {
            let order = self.executor.execute_market_order(pair, side, quantity)?;
            if let Some(router) = &self.router {
                router.register(order.order_id, self.algorithm().clone());
            }
            let execution = execution_for(&order, price);
            placed = Some(order);
            Ok(Some(execution))
        })?;

        if !accepted {
            warn!(algorithm = %self.algorithm(), %pair, %side, "Market order refused by allocation");
            return Ok(None);
        }
        if let Some(order) = &placed {
            info!(
                algorithm = %self.algorithm(), %pair, %side,
                order_id = order.order_id, %quantity, %price,
                "Placed full market order"
            );
        }
        Ok(placed)
    }

    /// Limit order for `quantity` base units at `price`.
    ///
    /// An order that is not filled on placement reserves its cost as locked
    /// funds until [`settle_limit_order`](Self::settle_limit_order) or
    /// [`cancel_limit_order`](Self::cancel_limit_order) releases them.
    pub fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Option<OrderUpdate>> {
        if price <= Decimal::ZERO {
            return Err(Error::InvalidArgument(format!("limit price must be positive, got {}", price)));
        }
        let quantity = pair.round_to_tradable(quantity);
        if quantity <= Decimal::ZERO {
            debug!(algorithm = %self.algorithm(), %pair, %side, "Nothing to trade");
            return Ok(None);
        }

        let reserved = reserved(pair, side, quantity, price);
        let proposal = TradeProposal::new(reserved.clone())?;

        let mut placed = None;
        let accepted = self.allocation.queue_trade(&proposal, |_| {
            let order = self.executor.execute_limit_order(pair, side, quantity, price)?;
            if let Some(router) = &self.router {
                router.register(order.order_id, self.algorithm().clone());
            }
            let execution = if order.status == OrderStatus::Filled {
                TradeExecution::from_order(&order)
            } else {
                lock(&reserved)
            };
            placed = Some(order);
            Ok(Some(execution))
        })?;

        if !accepted {
            warn!(algorithm = %self.algorithm(), %pair, %side, "Limit order refused by allocation");
            return Ok(None);
        }
        if let Some(order) = &placed {
            info!(
                algorithm = %self.algorithm(), %pair, %side,
                order_id = order.order_id, %quantity, %price, status = ?order.status,
                "Placed limit order"
            );
        }
        Ok(placed)
    }

    /// Book the fill of a resting limit order against its reserved funds
    pub fn settle_limit_order(&self, update: &OrderUpdate) -> Result<()> {
        if update.status != OrderStatus::Filled {
            return Err(Error::InvalidArgument(format!(
                "order {} is {:?}, only filled orders settle",
                update.order_id, update.status
            )));
        }
        let reserved = reserved(&update.pair, update.side, update.set_quantity, update.set_price);
        self.allocation.update_allocation(&unlock(&reserved))?;
        self.allocation.update_allocation(&TradeExecution::from_order(update))?;
        info!(algorithm = %self.algorithm(), order_id = update.order_id, pair = %update.pair, "Limit order settled");
        Ok(())
    }

    /// Cancel a resting limit order, release its reservation and book any partial fill
    pub fn cancel_limit_order(&self, order: &OrderUpdate) -> Result<OrderUpdate> {
        let update = self.cancel_order(&order.pair, order.order_id)?;
        let reserved = reserved(&order.pair, order.side, order.set_quantity, order.set_price);
        self.allocation.update_allocation(&unlock(&reserved))?;
        if update.filled_quantity > Decimal::ZERO {
            self.allocation.update_allocation(&TradeExecution::from_order(&update))?;
        }
        Ok(update)
    }

    pub fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate> {
        let update = self.executor.cancel_order(pair, order_id)?;
        if let Some(router) = &self.router {
            router.forget(order_id);
        }
        Ok(update)
    }
}

/// Funds a limit order commits: quote cost on buy, base quantity on sell
fn reserved(pair: &TradingPair, side: OrderSide, quantity: Decimal, price: Decimal) -> Balance {
    match side {
        OrderSide::Buy => Balance::new(pair.right.clone(), quantity * price, Decimal::ZERO),
        OrderSide::Sell => Balance::new(pair.left.clone(), quantity, Decimal::ZERO),
    }
}

fn lock(amount: &Balance) -> TradeExecution {
    TradeExecution::new(
        amount.clone(),
        Balance::new(amount.currency.clone(), Decimal::ZERO, amount.free),
    )
}

fn unlock(amount: &Balance) -> TradeExecution {
    TradeExecution::new(
        Balance::new(amount.currency.clone(), Decimal::ZERO, amount.free),
        amount.clone(),
    )
}

/// Realised movement of a placed order, estimated from `reference_price` until it fills
fn execution_for(order: &OrderUpdate, reference_price: Decimal) -> TradeExecution {
    if order.status == OrderStatus::Filled || !order.filled_quantity.is_zero() {
        return TradeExecution::from_order(order);
    }
    let mut estimate = order.clone();
    estimate.set_price = reference_price;
    TradeExecution::from_order(&estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationManager, StaticPortfolioFetcher};
    use crate::core::{AllocationWeights, Candle, Currency, Exchange, OrderType};
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct FlatPrice(Decimal);

    impl DataProvider for FlatPrice {
        fn current_price_last_trade(&self, _: &TradingPair) -> Result<Decimal> {
            Ok(self.0)
        }

        fn current_price_top_bid(&self, _: &TradingPair) -> Result<Decimal> {
            Ok(self.0)
        }

        fn current_price_top_ask(&self, _: &TradingPair) -> Result<Decimal> {
            Ok(self.0)
        }

        fn performance_past_hours(&self, _: &TradingPair, _: f64, _: DateTime<Utc>) -> Result<Decimal> {
            Ok(Decimal::ONE)
        }

        fn candles(&self, pair: &TradingPair, _: usize) -> Result<Vec<Candle>> {
            Err(Error::OutOfData(format!("no candles for {}", pair)))
        }
    }

    /// Acknowledges with status New, like a live exchange would
    #[derive(Default)]
    struct AckExecutor {
        placed: Mutex<Vec<(OrderSide, Decimal)>>,
    }

    impl OrderExecutor for AckExecutor {
        fn execute_market_order(&self, pair: &TradingPair, side: OrderSide, quantity: Decimal) -> Result<OrderUpdate> {
            let mut placed = self.placed.lock();
            placed.push((side, quantity));
            Ok(OrderUpdate::new(
                placed.len() as u64,
                0,
                OrderStatus::New,
                OrderType::Market,
                Utc::now(),
                side,
                pair.clone(),
                Decimal::ZERO,
                quantity,
            ))
        }

        fn execute_limit_order(
            &self,
            pair: &TradingPair,
            side: OrderSide,
            quantity: Decimal,
            price: Decimal,
        ) -> Result<OrderUpdate> {
            let mut placed = self.placed.lock();
            placed.push((side, quantity));
            Ok(OrderUpdate::new(
                placed.len() as u64,
                0,
                OrderStatus::New,
                OrderType::Limit,
                Utc::now(),
                side,
                pair.clone(),
                price,
                quantity,
            ))
        }

        fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate> {
            Ok(OrderUpdate::new(
                order_id,
                0,
                OrderStatus::Canceled,
                OrderType::Limit,
                Utc::now(),
                OrderSide::Buy,
                pair.clone(),
                Decimal::ZERO,
                Decimal::ZERO,
            ))
        }
    }

    async fn provider(executor: Arc<AckExecutor>, router: Option<OrderRouter>) -> TradingProvider {
        let exchange = Exchange::new("binance");
        let fetcher = StaticPortfolioFetcher::with(
            exchange.clone(),
            Portfolio::new([Balance::new(Currency::new("ETH"), dec!(1), Decimal::ZERO)]),
        );
        let manager = Arc::new(AllocationManager::new(Arc::new(fetcher)));
        let mut weights = AllocationWeights::new();
        weights
            .entry(exchange.clone())
            .or_default()
            .insert(AlgorithmId::new("algo"), dec!(0.5));
        manager.set_initial_configuration(weights).await.unwrap();

        TradingProvider::new(
            executor,
            Arc::new(FlatPrice(dec!(0.015))),
            manager.weak(AlgorithmId::new("algo"), exchange),
            router,
        )
    }

    #[tokio::test]
    async fn test_buy_spends_rounded_quote() {
        let executor = Arc::new(AckExecutor::default());
        let router = OrderRouter::new();
        let trading = provider(executor.clone(), Some(router.clone())).await;
        let pair = TradingPair::new("EOS", "ETH", 0);

        let order = trading
            .place_full_market_order(&pair, OrderSide::Buy)
            .unwrap()
            .unwrap();
        assert_eq!(order.set_quantity, dec!(33));
        assert_eq!(router.route(&order), Some(AlgorithmId::new("algo")));

        let portfolio = trading.portfolio().unwrap();
        assert_eq!(portfolio.allocation(&Currency::new("ETH")).free, dec!(0.005));
        assert_eq!(portfolio.allocation(&Currency::new("EOS")).free, dec!(33));
    }

    #[tokio::test]
    async fn test_sell_without_base_is_noop() {
        let executor = Arc::new(AckExecutor::default());
        let trading = provider(executor.clone(), None).await;
        let pair = TradingPair::new("EOS", "ETH", 0);

        assert!(trading.place_full_market_order(&pair, OrderSide::Sell).unwrap().is_none());
        assert!(executor.placed.lock().is_empty());
    }

    fn funds(trading: &TradingProvider, currency: &str) -> Balance {
        trading.portfolio().unwrap().allocation(&Currency::new(currency))
    }

    #[tokio::test]
    async fn test_limit_order_locks_then_settles() {
        let executor = Arc::new(AckExecutor::default());
        let trading = provider(executor.clone(), None).await;
        let pair = TradingPair::new("EOS", "ETH", 0);

        let order = trading
            .place_limit_order(&pair, OrderSide::Buy, dec!(40.7), dec!(0.01))
            .unwrap()
            .unwrap();
        assert_eq!(order.set_quantity, dec!(40));
        assert_eq!(funds(&trading, "ETH"), Balance::new(Currency::new("ETH"), dec!(0.1), dec!(0.4)));

        let filled = order.filled(dec!(0.0095), dec!(0.04), Currency::new("EOS"));
        trading.settle_limit_order(&filled).unwrap();
        assert_eq!(funds(&trading, "ETH"), Balance::new(Currency::new("ETH"), dec!(0.12), Decimal::ZERO));
        assert_eq!(funds(&trading, "EOS").free, dec!(39.96));
    }

    #[tokio::test]
    async fn test_limit_order_cancel_releases_reservation() {
        let executor = Arc::new(AckExecutor::default());
        let trading = provider(executor.clone(), None).await;
        let pair = TradingPair::new("EOS", "ETH", 0);

        let order = trading
            .place_limit_order(&pair, OrderSide::Buy, dec!(20), dec!(0.02))
            .unwrap()
            .unwrap();
        assert_eq!(funds(&trading, "ETH").locked, dec!(0.4));

        trading.cancel_limit_order(&order).unwrap();
        assert_eq!(funds(&trading, "ETH"), Balance::new(Currency::new("ETH"), dec!(0.5), Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_limit_order_beyond_allocation_refused() {
        let executor = Arc::new(AckExecutor::default());
        let trading = provider(executor.clone(), None).await;
        let pair = TradingPair::new("EOS", "ETH", 0);

        assert!(trading
            .place_limit_order(&pair, OrderSide::Buy, dec!(60), dec!(0.01))
            .unwrap()
            .is_none());
        assert!(executor.placed.lock().is_empty());
        assert!(matches!(
            trading.place_limit_order(&pair, OrderSide::Sell, dec!(1), Decimal::ZERO),
            Err(Error::InvalidArgument(_))
        ));
    }
}
