//! Backtest engine - Deterministic replay of candle history
//!
//! Every algorithm owns a virtual clock shared by its data provider, order
//! executor and timer. The engine walks candle close times in ascending
//! order; an algorithm whose clock already ran past a close time (because a
//! timer jumped it forward) skips that step.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::algorithm::{AlgorithmRuntime, RuntimeEvent, RuntimeServices, StateSwitch, registry};
use crate::allocation::{AllocationManager, StaticPortfolioFetcher};
use crate::core::config::{AppConfig, BacktestConfig};
use crate::core::{AlgorithmId, Currency, Error, Portfolio, Result, RunMode};
use crate::providers::{BacktestDataProvider, BacktestOrderExecutor, CandleStore, DataProvider, Ledger, LedgerRecord, TradingProvider};
use crate::timer::{BacktestTimer, VirtualClock};

/// Outcome of one replay
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub ledger: Vec<LedgerRecord>,
    /// State switches, grouped per algorithm in configuration order
    pub switches: Vec<StateSwitch>,
    pub portfolios: BTreeMap<AlgorithmId, Portfolio>,
    /// Final portfolio worth in `base_currency`, priced at each algorithm's last visible close
    pub valuations: BTreeMap<AlgorithmId, Decimal>,
    pub base_currency: Currency,
    pub halted: Vec<AlgorithmId>,
}

struct Slot {
    runtime: Box<dyn AlgorithmRuntime>,
    clock: VirtualClock,
    data: Arc<BacktestDataProvider>,
}

pub struct BacktestEngine {
    store: Arc<CandleStore>,
    ledger: Arc<Ledger>,
    allocation: Arc<AllocationManager>,
    base_currency: Currency,
    slots: Vec<Slot>,
}

impl BacktestEngine {
    /// Load candles from the configured CSV and write the ledger to the configured output
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let backtest = backtest_section(config)?;
        let store = CandleStore::load_csv(&backtest.candles, backtest.candle_width()?)?;
        let sink = File::create(&backtest.output).map_err(|e| {
            Error::Config(format!("Cannot create ledger {}: {}", backtest.output.display(), e))
        })?;
        Self::new(config, Arc::new(store), Arc::new(Ledger::with_sink(Box::new(sink)))).await
    }

    pub async fn new(config: &AppConfig, store: Arc<CandleStore>, ledger: Arc<Ledger>) -> Result<Self> {
        let backtest = backtest_section(config)?;
        let weights = config.weights();

        let fetcher = StaticPortfolioFetcher::new();
        for exchange in weights.keys() {
            fetcher.set_portfolio(exchange.clone(), backtest.initial_portfolio());
        }
        let allocation = Arc::new(AllocationManager::new(Arc::new(fetcher)));
        allocation.set_initial_configuration(weights).await?;

        let mut slots = Vec::with_capacity(config.algorithms.len());
        for algorithm in &config.algorithms {
            let id = algorithm.algorithm_id();
            let exchange = algorithm.exchange();
            let clock = VirtualClock::new(backtest.start);

            let data = Arc::new(BacktestDataProvider::new(Arc::clone(&store), clock.clone()));
            let executor = Arc::new(BacktestOrderExecutor::new(
                Arc::clone(&data),
                Arc::clone(&ledger),
                backtest.fee_rate,
            ));
            let services = RuntimeServices {
                trading: TradingProvider::new(
                    executor,
                    Arc::clone(&data) as Arc<dyn DataProvider>,
                    allocation.weak(id.clone(), exchange.clone()),
                    None,
                ),
                algorithm: id,
                exchange,
                mode: RunMode::Backtest,
                data: Arc::clone(&data) as Arc<dyn DataProvider>,
                timer: Arc::new(BacktestTimer::new(clock.clone())),
            };
            slots.push(Slot {
                runtime: registry::build(algorithm, services)?,
                clock,
                data,
            });
        }

        info!(
            algorithms = slots.len(),
            start = %backtest.start,
            fee_rate = %backtest.fee_rate,
            "Backtest prepared"
        );
        Ok(Self {
            store,
            ledger,
            allocation,
            base_currency: Currency::new(config.app.base_currency.as_str()),
            slots,
        })
    }

    /// Replay the whole candle history once
    pub fn run(mut self) -> Result<BacktestReport> {
        for slot in &mut self.slots {
            let started = slot.runtime.start().and_then(|_| slot.runtime.drain());
            if let Err(e) = started {
                warn!(algorithm = %slot.runtime.algorithm(), "Failed to start: {}", e);
            }
        }

        let close_times = self.store.close_times();
        debug!(steps = close_times.len(), "Replaying candles");
        for t in close_times {
            for slot in &mut self.slots {
                if slot.runtime.status().is_halted() || slot.clock.now() > t {
                    continue;
                }
                slot.clock.advance_to(t);
                let stepped = slot
                    .runtime
                    .handle(RuntimeEvent::MarketTick)
                    .and_then(|_| slot.runtime.drain());
                if let Err(e) = stepped {
                    warn!(algorithm = %slot.runtime.algorithm(), at = %t, "Algorithm isolated: {}", e);
                }
            }
        }
        self.ledger.flush()?;

        let mut switches = Vec::new();
        let mut portfolios = BTreeMap::new();
        let mut valuations = BTreeMap::new();
        let mut halted = Vec::new();
        for slot in &self.slots {
            let algorithm = slot.runtime.algorithm();
            switches.extend_from_slice(slot.runtime.switches());
            let portfolio = self.allocation.get_all_funds(slot.runtime.exchange(), algorithm)?;
            match slot.data.valuate_portfolio(&portfolio, &self.base_currency) {
                Ok(value) => {
                    valuations.insert(algorithm.clone(), value);
                }
                Err(e) => warn!(%algorithm, base = %self.base_currency, "Final portfolio not valued: {}", e),
            }
            portfolios.insert(algorithm.clone(), portfolio);
            if slot.runtime.status().is_halted() {
                halted.push(algorithm.clone());
            }
        }

        let report = BacktestReport {
            ledger: self.ledger.records(),
            switches,
            portfolios,
            valuations,
            base_currency: self.base_currency,
            halted,
        };
        info!(
            trades = report.ledger.len(),
            switches = report.switches.len(),
            halted = report.halted.len(),
            "Backtest finished"
        );
        Ok(report)
    }
}

impl BacktestReport {
    /// Total fees paid per asset
    pub fn fees(&self) -> BTreeMap<String, Decimal> {
        let mut fees = BTreeMap::new();
        for record in &self.ledger {
            *fees.entry(record.fee_asset.to_string()).or_insert(Decimal::ZERO) += record.fee;
        }
        fees
    }

    pub fn portfolio(&self, algorithm: &AlgorithmId) -> Option<&Portfolio> {
        self.portfolios.get(algorithm)
    }
}

fn backtest_section(config: &AppConfig) -> Result<&BacktestConfig> {
    config
        .backtest
        .as_ref()
        .ok_or_else(|| Error::Config("Backtest requires a [backtest] section".to_string()))
}
