//! Bandwagon - Buys the best performer after a market-wide dip
//!
//! Entry watches the top performer over `check_hours`. When even the best
//! pair trades below `panic_threshold` it buys that pair and holds for
//! `hold_hours` (or until `take_profit`), sells, then cools down.

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::runtime::{AlgorithmRuntime, RuntimeServices, StateMachine};
use super::state::{State, StateContext, Transition};
use crate::core::config::AlgorithmConfig;
use crate::core::{Error, OrderSide, OrderUpdate, Result, TradingPair};

#[derive(Debug, Clone, Deserialize)]
struct BandwagonParams {
    pairs: Vec<String>,
    #[serde(default = "default_lot_decimals")]
    lot_decimals: u32,
    #[serde(default = "default_check_hours")]
    check_hours: f64,
    #[serde(default = "default_panic_threshold")]
    panic_threshold: Decimal,
    #[serde(default = "default_hold_hours")]
    hold_hours: i64,
    #[serde(default = "default_take_profit")]
    take_profit: Decimal,
    #[serde(default = "default_cooldown_hours")]
    cooldown_hours: i64,
}

fn default_lot_decimals() -> u32 {
    2
}

fn default_check_hours() -> f64 {
    2.0
}

fn default_panic_threshold() -> Decimal {
    Decimal::new(98, 2)
}

fn default_hold_hours() -> i64 {
    4
}

fn default_take_profit() -> Decimal {
    Decimal::new(1005, 3)
}

fn default_cooldown_hours() -> i64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "BandwagonParams")]
pub struct BandwagonSettings {
    pub pairs: Vec<TradingPair>,
    pub check_hours: f64,
    pub panic_threshold: Decimal,
    pub hold: chrono::Duration,
    pub take_profit: Decimal,
    pub cooldown: chrono::Duration,
}

impl TryFrom<BandwagonParams> for BandwagonSettings {
    type Error = Error;

    fn try_from(params: BandwagonParams) -> Result<Self> {
        if params.pairs.is_empty() {
            return Err(Error::Config("bandwagon needs at least one pair".to_string()));
        }
        if !params.check_hours.is_finite() || params.check_hours <= 0.0 {
            return Err(Error::Config(format!("check_hours must be positive, got {}", params.check_hours)));
        }
        if params.hold_hours < 0 || params.cooldown_hours < 0 {
            return Err(Error::Config("hold_hours and cooldown_hours must not be negative".to_string()));
        }
        if params.take_profit <= Decimal::ZERO || params.panic_threshold <= Decimal::ZERO {
            return Err(Error::Config("take_profit and panic_threshold must be positive".to_string()));
        }

        let pairs = params
            .pairs
            .iter()
            .map(|p| TradingPair::parse(p, params.lot_decimals))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pairs,
            check_hours: params.check_hours,
            panic_threshold: params.panic_threshold,
            hold: hours_setting("hold_hours", params.hold_hours)?,
            take_profit: params.take_profit,
            cooldown: hours_setting("cooldown_hours", params.cooldown_hours)?,
        })
    }
}

fn hours_setting(name: &str, hours: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_hours(hours)
        .ok_or_else(|| Error::Config(format!("{} = {} is out of range", name, hours)))
}

pub fn build(config: &AlgorithmConfig, services: RuntimeServices) -> Result<Box<dyn AlgorithmRuntime>> {
    let settings: BandwagonSettings = config.settings()?;
    debug!(algorithm = %config.id, pairs = settings.pairs.len(), "Building bandwagon");
    Ok(Box::new(StateMachine::new(settings, Box::new(EntryState), services)))
}

pub struct EntryState;

impl State<BandwagonSettings> for EntryState {
    fn name(&self) -> &'static str {
        "EntryState"
    }

    fn run(&mut self, _: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        Ok(Transition::Stay)
    }

    fn on_market_condition(&mut self, ctx: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        let settings = ctx.settings();
        let (winner, performance) = match ctx
            .data()
            .top_performance(&settings.pairs, settings.check_hours, ctx.now())
        {
            Ok(top) => top,
            // Not enough history yet
            Err(Error::OutOfData(reason)) => {
                debug!(algorithm = %ctx.algorithm(), %reason, "Skipping market check");
                return Ok(Transition::Stay);
            }
            Err(e) => return Err(e),
        };

        if performance < settings.panic_threshold {
            info!(algorithm = %ctx.algorithm(), %winner, %performance, "Panic detected, entering");
            return Ok(Transition::to(BuyState::new(winner)));
        }
        Ok(Transition::Stay)
    }
}

pub struct BuyState {
    pair: TradingPair,
    entry_price: Decimal,
}

impl BuyState {
    pub fn new(pair: TradingPair) -> Self {
        Self {
            pair,
            entry_price: Decimal::ZERO,
        }
    }
}

impl State<BandwagonSettings> for BuyState {
    fn name(&self) -> &'static str {
        "BuyState"
    }

    fn run(&mut self, ctx: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        let trading = ctx.trading();
        debug!(algorithm = %ctx.algorithm(), portfolio = %trading.portfolio()?.to_json(), "Before buy");

        let Some(order) = trading.place_full_market_order(&self.pair, OrderSide::Buy)? else {
            warn!(algorithm = %ctx.algorithm(), pair = %self.pair, "Nothing bought, back to entry");
            return Ok(Transition::to(EntryState));
        };
        self.entry_price = if order.average_filled_price.is_zero() {
            order.set_price
        } else {
            order.average_filled_price
        };

        debug!(algorithm = %ctx.algorithm(), portfolio = %trading.portfolio()?.to_json(), "After buy");
        ctx.set_timer(ctx.settings().hold)?;
        Ok(Transition::Stay)
    }

    fn on_market_condition(&mut self, ctx: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        let price = ctx.data().current_price_last_trade(&self.pair)?;
        if !self.entry_price.is_zero() && price > self.entry_price * ctx.settings().take_profit {
            info!(algorithm = %ctx.algorithm(), pair = %self.pair, %price, "Price has increased, selling");
            return Ok(Transition::to(SellState::new(self.pair.clone())));
        }
        Ok(Transition::Stay)
    }

    fn on_order_update(
        &mut self,
        update: &OrderUpdate,
        ctx: &StateContext<BandwagonSettings>,
    ) -> Result<Transition<BandwagonSettings>> {
        debug!(algorithm = %ctx.algorithm(), order_id = update.order_id, status = ?update.status, "Buy order update");
        Ok(Transition::Stay)
    }

    fn on_timer_elapsed(&mut self, ctx: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        info!(algorithm = %ctx.algorithm(), pair = %self.pair, "Hold time has exceeded, selling");
        Ok(Transition::to(SellState::new(self.pair.clone())))
    }
}

pub struct SellState {
    pair: TradingPair,
}

impl SellState {
    pub fn new(pair: TradingPair) -> Self {
        Self { pair }
    }
}

impl State<BandwagonSettings> for SellState {
    fn name(&self) -> &'static str {
        "SellState"
    }

    fn run(&mut self, ctx: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        ctx.trading().place_full_market_order(&self.pair, OrderSide::Sell)?;
        ctx.set_timer(ctx.settings().cooldown)?;
        Ok(Transition::Stay)
    }

    fn on_order_update(
        &mut self,
        update: &OrderUpdate,
        ctx: &StateContext<BandwagonSettings>,
    ) -> Result<Transition<BandwagonSettings>> {
        debug!(algorithm = %ctx.algorithm(), order_id = update.order_id, status = ?update.status, "Sell order update");
        Ok(Transition::Stay)
    }

    fn on_timer_elapsed(&mut self, _: &StateContext<BandwagonSettings>) -> Result<Transition<BandwagonSettings>> {
        Ok(Transition::to(EntryState))
    }
}
