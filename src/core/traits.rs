//! Core traits - Seams to the exchange collaborator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::core::observable::Observable;
use crate::core::{Result, types::*};

/// Exchange client - wire protocol lives behind this trait
///
/// Implementations publish order-fill events through [`ExchangeClient::order_updates`]
/// and report failures as [`crate::core::Error::Communication`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange this client talks to
    fn exchange(&self) -> Exchange;

    /// Open connections and start the order-update stream
    async fn connect(&self) -> Result<()>;

    /// Fetch current top of book
    async fn fetch_ticker(&self, pair: &TradingPair) -> Result<Ticker>;

    /// Fetch candles between `start` and `end`, oldest first
    async fn fetch_candles(
        &self,
        pair: &TradingPair,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Place a market order for `quantity` units of the base asset
    async fn place_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderUpdate>;

    /// Place a limit order for `quantity` units of the base asset at `price`
    async fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate>;

    /// Cancel an open order
    async fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate>;

    /// Fetch full account holdings
    async fn fetch_portfolio(&self) -> Result<Portfolio>;

    /// Order-fill events in the order the exchange reports them
    fn order_updates(&self) -> Observable<OrderUpdate>;
}
