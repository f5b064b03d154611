//! Providers - Market data and order execution behind one interface
//!
//! Live implementations talk to an [`ExchangeClient`]; backtest ones replay
//! candles against a virtual clock. Algorithms only see the traits.

pub mod backtest;
pub mod live;
pub mod trading;

pub use crate::core::ExchangeClient;
pub use backtest::{BacktestDataProvider, BacktestOrderExecutor, CandleStore, Ledger, LedgerRecord, LedgerWriter};
pub use live::{LiveDataProvider, LiveOrderExecutor, OrderRouter};
pub use trading::TradingProvider;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::allocation::WeakAllocationManager;
use crate::core::{
    Candle, Currency, Error, Exchange, OrderSide, OrderUpdate, Portfolio, Result, RunMode, TradingPair,
};

/// Read-only market queries
pub trait DataProvider: Send + Sync {
    fn current_price_last_trade(&self, pair: &TradingPair) -> Result<Decimal>;

    fn current_price_top_bid(&self, pair: &TradingPair) -> Result<Decimal>;

    fn current_price_top_ask(&self, pair: &TradingPair) -> Result<Decimal>;

    /// Close of the last candle over open of the first, for the `hours_back` hours ending at `end_time`
    fn performance_past_hours(
        &self,
        pair: &TradingPair,
        hours_back: f64,
        end_time: DateTime<Utc>,
    ) -> Result<Decimal>;

    /// Best performing pair; ties keep the earlier pair
    fn top_performance(
        &self,
        pairs: &[TradingPair],
        hours_back: f64,
        end_time: DateTime<Utc>,
    ) -> Result<(TradingPair, Decimal)> {
        check_hours_back(hours_back)?;

        let mut best: Option<(TradingPair, Decimal)> = None;
        for pair in pairs {
            let performance = self.performance_past_hours(pair, hours_back, end_time)?;
            if best.as_ref().is_none_or(|(_, top)| performance > *top) {
                best = Some((pair.clone(), performance));
            }
        }
        best.ok_or_else(|| Error::InvalidArgument("no trading pairs to evaluate".to_string()))
    }

    /// The `count` most recently closed candles, newest first
    fn candles(&self, pair: &TradingPair, count: usize) -> Result<Vec<Candle>>;

    /// Highest high of the `count` most recently closed candles
    fn highest_high(&self, pair: &TradingPair, count: usize) -> Result<Decimal> {
        self.candles(pair, count)?
            .iter()
            .map(|c| c.high)
            .max()
            .ok_or_else(|| Error::OutOfData(format!("no candles for {}", pair)))
    }

    /// Lowest low of the `count` most recently closed candles
    fn lowest_low(&self, pair: &TradingPair, count: usize) -> Result<Decimal> {
        self.candles(pair, count)?
            .iter()
            .map(|c| c.low)
            .min()
            .ok_or_else(|| Error::OutOfData(format!("no candles for {}", pair)))
    }

    /// Value of `portfolio` in `base`, pricing other holdings at the top bid against `base`
    fn valuate_portfolio(&self, portfolio: &Portfolio, base: &Currency) -> Result<Decimal> {
        let mut value = Decimal::ZERO;
        for balance in portfolio.balances().filter(|b| !b.is_zero()) {
            if balance.currency == *base {
                value += balance.total();
                continue;
            }
            let pair = TradingPair::new(balance.currency.clone(), base.clone(), 0);
            value += balance.total() * self.current_price_top_bid(&pair)?;
        }
        Ok(value)
    }
}

/// Places orders on an exchange, unaware of allocations
pub trait OrderExecutor: Send + Sync {
    /// Market order for `quantity` units of the base asset
    fn execute_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderUpdate>;

    /// Limit order for `quantity` units of the base asset at `price`
    fn execute_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate>;

    fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate>;
}

/// Data and execution providers of one exchange in one run mode
#[derive(Clone)]
pub struct ExchangeProviders {
    pub exchange: Exchange,
    pub mode: RunMode,
    pub data: Arc<dyn DataProvider>,
    pub executor: Arc<dyn OrderExecutor>,
    pub router: Option<OrderRouter>,
}

impl ExchangeProviders {
    /// Trading provider scoped to one algorithm's allocation
    pub fn trading_for(&self, allocation: WeakAllocationManager) -> TradingProvider {
        TradingProvider::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.data),
            allocation,
            self.router.clone(),
        )
    }
}

pub(crate) fn check_hours_back(hours_back: f64) -> Result<()> {
    if !hours_back.is_finite() || hours_back <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "hours_back should be larger than 0 but was {}",
            hours_back
        )));
    }
    Ok(())
}

pub(crate) fn check_candle_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::InvalidArgument("number of candles should be larger than 0".to_string()));
    }
    Ok(())
}

/// Start of the `hours_back` hours ending at `end_time`
pub(crate) fn window_start(end_time: DateTime<Utc>, hours_back: f64) -> Result<DateTime<Utc>> {
    check_hours_back(hours_back)?;
    let millis = (hours_back * 3_600_000.0).round();
    let out_of_range = || {
        Error::InvalidArgument(format!(
            "hours_back {} reaches beyond the representable time range from {}",
            hours_back, end_time
        ))
    };
    if millis >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    let span = TimeDelta::try_milliseconds(millis as i64).ok_or_else(out_of_range)?;
    end_time.checked_sub_signed(span).ok_or_else(out_of_range)
}

/// Last close over first open of an oldest-first candle window
pub(crate) fn performance(pair: &TradingPair, candles: &[Candle]) -> Result<Decimal> {
    let (first, last) = match (candles.first(), candles.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(Error::OutOfData(format!("no candles for {} in window", pair)));
        }
    };
    last.close
        .checked_div(first.open)
        .ok_or_else(|| Error::InvalidArgument(format!("zero open price for {}", pair)))
}
