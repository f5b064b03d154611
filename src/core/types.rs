//! Core types - Strong typing for currencies, balances and orders

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Error, Result};

/// Asset symbol (e.g., "ETH"), compared by value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Currency::new(s)
    }
}

/// Exchange identifier (e.g., "binance", "backtest")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Exchange(String);

impl Exchange {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Exchange {
    fn from(s: &str) -> Self {
        Exchange::new(s)
    }
}

/// Identity of one running algorithm instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlgorithmId(String);

impl AlgorithmId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AlgorithmId {
    fn from(s: &str) -> Self {
        AlgorithmId::new(s)
    }
}

/// Weight factor per (exchange, algorithm), each in (0, 1]
pub type AllocationWeights = BTreeMap<Exchange, BTreeMap<AlgorithmId, Decimal>>;

/// Free and locked amount of one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: Currency,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(currency: Currency, free: Decimal, locked: Decimal) -> Self {
        Self {
            currency,
            free,
            locked,
        }
    }

    /// Zero balance of `currency`
    pub fn empty(currency: Currency) -> Self {
        Self::new(currency, Decimal::ZERO, Decimal::ZERO)
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    pub fn is_zero(&self) -> bool {
        self.free.is_zero() && self.locked.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.free < Decimal::ZERO || self.locked < Decimal::ZERO
    }

    /// True if both components fit inside `other`
    pub fn fits_within(&self, other: &Balance) -> bool {
        self.free <= other.free && self.locked <= other.locked
    }

    pub fn scaled(&self, factor: Decimal) -> Balance {
        Balance::new(self.currency.clone(), self.free * factor, self.locked * factor)
    }

    fn ensure_same_currency(&self, other: &Balance) -> Result<()> {
        if self.currency != other.currency {
            return Err(Error::InvalidArgument(format!(
                "cannot combine {} with {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }

    /// Subtract `other`, failing instead of going negative
    pub fn checked_sub(&self, other: &Balance) -> Result<Balance> {
        self.ensure_same_currency(other)?;
        if !other.fits_within(self) {
            return Err(Error::InvalidExecution(format!(
                "debit {} exceeds balance {}",
                other, self
            )));
        }
        Ok(Balance::new(
            self.currency.clone(),
            self.free - other.free,
            self.locked - other.locked,
        ))
    }

    pub fn checked_add(&self, other: &Balance) -> Result<Balance> {
        self.ensure_same_currency(other)?;
        Ok(Balance::new(
            self.currency.clone(),
            self.free + other.free,
            self.locked + other.locked,
        ))
    }
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (free: {}, locked: {})", self.currency, self.free, self.locked)
    }
}

/// Mapping currency -> balance, either remote holdings or one algorithm's share
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    balances: BTreeMap<Currency, Balance>,
}

impl Portfolio {
    pub fn new(balances: impl IntoIterator<Item = Balance>) -> Self {
        Self {
            balances: balances
                .into_iter()
                .map(|b| (b.currency.clone(), b))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Balance of `currency`, zero if never held
    pub fn allocation(&self, currency: &Currency) -> Balance {
        self.balances
            .get(currency)
            .cloned()
            .unwrap_or_else(|| Balance::empty(currency.clone()))
    }

    pub fn balances(&self) -> impl Iterator<Item = &Balance> {
        self.balances.values()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    /// Copy with every free/locked amount multiplied by `scale`
    pub fn duplicate_with_scale(&self, scale: Decimal) -> Result<Portfolio> {
        if scale <= Decimal::ZERO || scale > Decimal::ONE {
            return Err(Error::Config(format!(
                "scale should be in (0, 1] but was {}",
                scale
            )));
        }
        Ok(Portfolio::new(self.balances().map(|b| b.scaled(scale))))
    }

    /// Currency-wise sum of two portfolios
    pub fn add(first: &Portfolio, second: &Portfolio) -> Portfolio {
        let mut sum = first.clone();
        for balance in second.balances() {
            let merged = sum.allocation(&balance.currency);
            sum.balances.insert(
                balance.currency.clone(),
                Balance::new(
                    balance.currency.clone(),
                    merged.free + balance.free,
                    merged.locked + balance.locked,
                ),
            );
        }
        sum
    }

    /// Non-zero per-currency differences `first - second`
    pub fn subtracted_differences(first: &Portfolio, second: &Portfolio) -> Vec<Balance> {
        let currencies: std::collections::BTreeSet<&Currency> = first
            .balances
            .keys()
            .chain(second.balances.keys())
            .collect();

        currencies
            .into_iter()
            .map(|c| {
                let a = first.allocation(c);
                let b = second.allocation(c);
                Balance::new(c.clone(), a.free - b.free, a.locked - b.locked)
            })
            .filter(|b| !b.is_zero())
            .collect()
    }

    /// Debit `execution.from`, credit `execution.to`; all-or-nothing
    pub fn apply_execution(&mut self, execution: &TradeExecution) -> Result<()> {
        for side in [&execution.from, &execution.to] {
            if side.is_negative() {
                return Err(Error::InvalidExecution(format!("negative amount {}", side)));
            }
        }

        let debited = self
            .allocation(&execution.from.currency)
            .checked_sub(&execution.from)?;

        let credited = if execution.to.currency == execution.from.currency {
            debited.checked_add(&execution.to)?
        } else {
            self.allocation(&execution.to.currency)
                .checked_add(&execution.to)?
        };

        self.balances.insert(debited.currency.clone(), debited);
        self.balances.insert(credited.currency.clone(), credited);
        Ok(())
    }

    /// JSON array of non-zero balances
    pub fn to_json(&self) -> String {
        let non_zero: Vec<&Balance> = self.balances().filter(|b| !b.is_zero()).collect();
        serde_json::to_string(&non_zero).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Market pair, `left` is the base asset and `right` the quote asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradingPair {
    pub left: Currency,
    pub right: Currency,
    pub decimals: u32,
}

impl TradingPair {
    pub fn new(left: impl Into<Currency>, right: impl Into<Currency>, decimals: u32) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            decimals,
        }
    }

    /// Parse "EOS/ETH" or "EOS-ETH"
    pub fn parse(s: &str, decimals: u32) -> Result<Self> {
        let mut parts = s.split(['/', '-']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(left), Some(right), None) if !left.trim().is_empty() && !right.trim().is_empty() => {
                Ok(Self::new(Currency::new(left), Currency::new(right), decimals))
            }
            _ => Err(Error::InvalidArgument(format!(
                "trading pair '{}' should look like BASE/QUOTE",
                s
            ))),
        }
    }

    /// Floor `amount` to the lot precision of this pair
    pub fn round_to_tradable(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.decimals, rust_decimal::RoundingStrategy::ToZero)
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.left, self.right)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Order-fill event published by the exchange collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub trade_id: u64,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub created_timestamp: DateTime<Utc>,
    pub side: OrderSide,
    pub pair: TradingPair,
    pub set_price: Decimal,
    pub set_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_filled_price: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<Currency>,
}

impl OrderUpdate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: u64,
        trade_id: u64,
        status: OrderStatus,
        order_type: OrderType,
        created_timestamp: DateTime<Utc>,
        side: OrderSide,
        pair: TradingPair,
        set_price: Decimal,
        set_quantity: Decimal,
    ) -> Self {
        Self {
            order_id,
            trade_id,
            status,
            order_type,
            created_timestamp,
            side,
            pair,
            set_price,
            set_quantity,
            filled_quantity: Decimal::ZERO,
            average_filled_price: Decimal::ZERO,
            commission: Decimal::ZERO,
            commission_asset: None,
        }
    }

    /// Mark as completely filled at `price`, charging `commission` in `asset`
    pub fn filled(mut self, price: Decimal, commission: Decimal, asset: Currency) -> Self {
        self.status = OrderStatus::Filled;
        self.filled_quantity = self.set_quantity;
        self.average_filled_price = price;
        self.commission = commission;
        self.commission_asset = Some(asset);
        self
    }
}

/// Amount an algorithm wishes to commit from one currency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeProposal {
    from: Balance,
}

impl TradeProposal {
    pub fn new(from: Balance) -> Result<Self> {
        if from.free.is_sign_negative() || from.locked.is_sign_negative() {
            return Err(Error::InvalidArgument(format!(
                "trade proposal cannot be negative: {}",
                from
            )));
        }
        Ok(Self { from })
    }

    pub fn from(&self) -> &Balance {
        &self.from
    }
}

/// Realised result of an accepted proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecution {
    pub from: Balance,
    pub to: Balance,
}

impl TradeExecution {
    pub fn new(from: Balance, to: Balance) -> Self {
        Self { from, to }
    }

    /// Derive the balance movement of an order, net of commission in the received asset
    pub fn from_order(order: &OrderUpdate) -> Self {
        let pair = &order.pair;
        let (quantity, price) = if order.filled_quantity.is_zero() {
            (order.set_quantity, order.set_price)
        } else {
            (order.filled_quantity, order.average_filled_price)
        };
        let notional = quantity * price;

        let (from, to_currency, to_amount) = match order.side {
            OrderSide::Buy => (
                Balance::new(pair.right.clone(), notional, Decimal::ZERO),
                pair.left.clone(),
                quantity,
            ),
            OrderSide::Sell => (
                Balance::new(pair.left.clone(), quantity, Decimal::ZERO),
                pair.right.clone(),
                notional,
            ),
        };

        let fee = match &order.commission_asset {
            Some(asset) if *asset == to_currency => order.commission.min(to_amount),
            _ => Decimal::ZERO,
        };

        Self::new(from, Balance::new(to_currency, to_amount - fee, Decimal::ZERO))
    }
}

/// OHLCV candle; `timestamp` is the open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn close_time(&self, width: Duration) -> DateTime<Utc> {
        self.timestamp + width
    }
}

/// Top-of-book snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: TradingPair,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}
