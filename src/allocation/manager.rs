//! Allocation manager - Single authority over the shared portfolio
//!
//! The remote portfolio of every exchange is split into one sub-portfolio per
//! algorithm. Each sub-portfolio sits behind its own mutex; admission check,
//! trade callback and balance mutation all happen while holding it, so two
//! proposals of the same algorithm can never spend the same funds.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fetcher::PortfolioFetcher;
use super::weak::WeakAllocationManager;
use crate::core::config::validate_weights;
use crate::core::{
    AlgorithmId, AllocationWeights, Balance, Currency, Error, Exchange, Portfolio, Result,
    TradeExecution, TradeProposal,
};

type Allocations = BTreeMap<Exchange, BTreeMap<AlgorithmId, Arc<Mutex<Portfolio>>>>;

pub struct AllocationManager {
    fetcher: Arc<dyn PortfolioFetcher>,
    allocations: RwLock<Option<Allocations>>,
    weights: RwLock<AllocationWeights>,
}

impl AllocationManager {
    pub fn new(fetcher: Arc<dyn PortfolioFetcher>) -> Self {
        Self {
            fetcher,
            allocations: RwLock::new(None),
            weights: RwLock::new(AllocationWeights::new()),
        }
    }

    /// Scale every exchange's remote portfolio by each algorithm's weight.
    /// Calling it again replaces the previous configuration wholesale.
    pub async fn set_initial_configuration(&self, weights: AllocationWeights) -> Result<()> {
        validate_weights(&weights)?;

        let mut allocations = Allocations::new();
        for (exchange, algorithms) in &weights {
            let remote = self.fetcher.get_portfolio(exchange).await?;
            let mut scaled = BTreeMap::new();
            for (algorithm, factor) in algorithms {
                let portfolio = remote.duplicate_with_scale(*factor)?;
                debug!(%exchange, %algorithm, %factor, portfolio = %portfolio.to_json(), "initial allocation");
                scaled.insert(algorithm.clone(), Arc::new(Mutex::new(portfolio)));
            }
            allocations.insert(exchange.clone(), scaled);
        }

        *self.allocations.write() = Some(allocations);
        *self.weights.write() = weights;
        info!("Allocation manager configured");
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.allocations.read().is_some()
    }

    /// Weights of the current configuration
    pub fn weights(&self) -> AllocationWeights {
        self.weights.read().clone()
    }

    fn slot(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<Arc<Mutex<Portfolio>>> {
        let allocations = self.allocations.read();
        let allocations = allocations
            .as_ref()
            .ok_or_else(|| Error::NotConfigured("initialise allocations first".to_string()))?;
        allocations
            .get(exchange)
            .and_then(|algorithms| algorithms.get(algorithm))
            .cloned()
            .ok_or_else(|| Error::UnknownAllocation {
                exchange: exchange.clone(),
                algorithm: algorithm.clone(),
            })
    }

    /// Tracked balance of `currency`, zero if never held
    pub fn get_available_funds(
        &self,
        exchange: &Exchange,
        algorithm: &AlgorithmId,
        currency: &Currency,
    ) -> Result<Balance> {
        Ok(self.slot(exchange, algorithm)?.lock().allocation(currency))
    }

    pub fn get_all_funds(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<Portfolio> {
        Ok(self.slot(exchange, algorithm)?.lock().clone())
    }

    /// Admit `proposal` if the algorithm holds enough of its currency.
    ///
    /// Returns `Ok(false)` without calling `callback` when funds are short.
    /// Otherwise `callback` runs exactly once; a `Some` execution is applied
    /// atomically, `None` accepts without touching balances. The callback must
    /// not call back into this manager for the same algorithm.
    pub fn queue_trade<F>(
        &self,
        proposal: &TradeProposal,
        algorithm: &AlgorithmId,
        exchange: &Exchange,
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(&TradeProposal) -> Result<Option<TradeExecution>>,
    {
        let slot = self.slot(exchange, algorithm)?;
        let mut portfolio = slot.lock();

        let available = portfolio.allocation(&proposal.from().currency);
        if !proposal.from().fits_within(&available) {
            warn!(
                %algorithm, %exchange,
                proposal = %proposal.from(), available = %available,
                "Trade proposal refused, insufficient allocation"
            );
            return Ok(false);
        }

        match callback(proposal)? {
            Some(execution) => {
                portfolio.apply_execution(&execution)?;
                info!(
                    %algorithm, %exchange,
                    from = %execution.from, to = %execution.to,
                    "Allocation update"
                );
            }
            None => debug!(%algorithm, %exchange, "Trade accepted without execution"),
        }
        Ok(true)
    }

    /// Apply an execution outside a proposal (fill reconciliation)
    pub fn update_allocation(
        &self,
        exchange: &Exchange,
        algorithm: &AlgorithmId,
        execution: &TradeExecution,
    ) -> Result<()> {
        let slot = self.slot(exchange, algorithm)?;
        slot.lock().apply_execution(execution)?;
        info!(%algorithm, %exchange, from = %execution.from, to = %execution.to, "Allocation update");
        Ok(())
    }

    /// Remote holdings minus the sum of all sub-allocations on `exchange`
    pub async fn resync(&self, exchange: &Exchange) -> Result<Vec<Balance>> {
        let slots: Vec<Arc<Mutex<Portfolio>>> = {
            let allocations = self.allocations.read();
            let allocations = allocations
                .as_ref()
                .ok_or_else(|| Error::NotConfigured("initialise allocations first".to_string()))?;
            allocations
                .get(exchange)
                .map(|algorithms| algorithms.values().cloned().collect())
                .unwrap_or_default()
        };

        let remote = self.fetcher.get_portfolio(exchange).await?;
        let allocated = slots
            .iter()
            .fold(Portfolio::empty(), |sum, slot| Portfolio::add(&sum, &slot.lock()));

        let differences = Portfolio::subtracted_differences(&remote, &allocated);
        for diff in &differences {
            if diff.free.is_sign_negative() || diff.locked.is_sign_negative() {
                warn!(%exchange, difference = %diff, "Allocations exceed remote portfolio");
            } else {
                debug!(%exchange, difference = %diff, "Unallocated remote funds");
            }
        }
        Ok(differences)
    }

    /// Facade bound to one (algorithm, exchange) pair
    pub fn weak(self: &Arc<Self>, algorithm: AlgorithmId, exchange: Exchange) -> WeakAllocationManager {
        WeakAllocationManager::new(Arc::clone(self), algorithm, exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::StaticPortfolioFetcher;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exchange() -> Exchange {
        Exchange::new("backtest")
    }

    fn algo() -> AlgorithmId {
        AlgorithmId::new("algo")
    }

    fn eth(free: Decimal) -> Balance {
        Balance::new(Currency::new("ETH"), free, Decimal::ZERO)
    }

    fn eos(free: Decimal) -> Balance {
        Balance::new(Currency::new("EOS"), free, Decimal::ZERO)
    }

    fn weights(factor: Decimal) -> AllocationWeights {
        let mut w = AllocationWeights::new();
        w.entry(exchange()).or_default().insert(algo(), factor);
        w
    }

    fn manager(total: Decimal) -> AllocationManager {
        let fetcher = StaticPortfolioFetcher::with(exchange(), Portfolio::new([eth(total)]));
        AllocationManager::new(Arc::new(fetcher))
    }

    async fn configured(total: Decimal) -> AllocationManager {
        let m = manager(total);
        m.set_initial_configuration(weights(Decimal::ONE)).await.unwrap();
        m
    }

    #[tokio::test]
    async fn test_scaled_funds_exact() {
        for factor in [dec!(1), dec!(0.001)] {
            let m = manager(dec!(3.14159));
            m.set_initial_configuration(weights(factor)).await.unwrap();
            let funds = m
                .get_available_funds(&exchange(), &algo(), &Currency::new("ETH"))
                .unwrap();
            assert_eq!(funds.free, dec!(3.14159) * factor);
        }
    }

    #[tokio::test]
    async fn test_out_of_range_factors_fail() {
        for factor in [dec!(-1), dec!(-0.0001), dec!(2.5)] {
            let m = manager(dec!(1));
            let result = m.set_initial_configuration(weights(factor)).await;
            assert!(matches!(result, Err(Error::Config(_))), "factor {} accepted", factor);
            assert!(!m.is_configured());
        }
    }

    #[tokio::test]
    async fn test_weight_sum_over_one_fails() {
        let m = manager(dec!(1));
        let mut w = weights(dec!(0.6));
        w.entry(exchange())
            .or_default()
            .insert(AlgorithmId::new("other"), dec!(0.6));
        assert!(m.set_initial_configuration(w).await.is_err());
    }

    #[test]
    fn test_use_before_configuration() {
        let m = manager(dec!(1));
        let funds = m.get_available_funds(&exchange(), &algo(), &Currency::new("ETH"));
        assert!(matches!(funds, Err(Error::NotConfigured(_))));

        let proposal = TradeProposal::new(eth(dec!(0.1))).unwrap();
        let result = m.queue_trade(&proposal, &algo(), &exchange(), |_| Ok(None));
        assert!(matches!(result, Err(Error::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_unknown_pair() {
        let m = configured(dec!(1)).await;
        let result = m.get_all_funds(&exchange(), &AlgorithmId::new("ghost"));
        assert!(matches!(result, Err(Error::UnknownAllocation { .. })));
    }

    #[tokio::test]
    async fn test_never_held_currency_is_zero() {
        let m = configured(dec!(1)).await;
        let funds = m
            .get_available_funds(&exchange(), &algo(), &Currency::new("BNB"))
            .unwrap();
        assert!(funds.is_zero());
    }

    #[tokio::test]
    async fn test_rejected_proposal_skips_callback() {
        let m = configured(dec!(1)).await;
        let before = m.get_all_funds(&exchange(), &algo()).unwrap();
        let calls = AtomicUsize::new(0);

        let proposal = TradeProposal::new(eth(dec!(1.0001))).unwrap();
        let accepted = m
            .queue_trade(&proposal, &algo(), &exchange(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(TradeExecution::new(eth(dec!(1)), eos(dec!(100)))))
            })
            .unwrap();

        assert!(!accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_accepted_proposal_moves_exact_amounts() {
        let m = configured(dec!(1)).await;
        let calls = AtomicUsize::new(0);

        let proposal = TradeProposal::new(eth(dec!(0.4))).unwrap();
        let accepted = m
            .queue_trade(&proposal, &algo(), &exchange(), |p| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(TradeExecution::new(p.from().clone(), eos(dec!(39.96)))))
            })
            .unwrap();

        assert!(accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let eth_left = m
            .get_available_funds(&exchange(), &algo(), &Currency::new("ETH"))
            .unwrap();
        let eos_held = m
            .get_available_funds(&exchange(), &algo(), &Currency::new("EOS"))
            .unwrap();
        assert_eq!(eth_left.free, dec!(0.6));
        assert_eq!(eos_held.free, dec!(39.96));
    }

    #[tokio::test]
    async fn test_none_execution_accepts_without_mutation() {
        let m = configured(dec!(1)).await;
        let before = m.get_all_funds(&exchange(), &algo()).unwrap();

        let proposal = TradeProposal::new(eth(dec!(0.5))).unwrap();
        assert!(m.queue_trade(&proposal, &algo(), &exchange(), |_| Ok(None)).unwrap());
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_callback_leaves_balances() {
        let m = configured(dec!(1)).await;
        let before = m.get_all_funds(&exchange(), &algo()).unwrap();

        let proposal = TradeProposal::new(eth(dec!(0.5))).unwrap();
        let result = m.queue_trade(&proposal, &algo(), &exchange(), |_| {
            Err(Error::Communication("exchange down".to_string()))
        });
        assert!(matches!(result, Err(Error::Communication(_))));
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_overdrawing_execution_rejected_whole() {
        let m = configured(dec!(1)).await;
        let before = m.get_all_funds(&exchange(), &algo()).unwrap();

        let proposal = TradeProposal::new(eth(dec!(0.5))).unwrap();
        let result = m.queue_trade(&proposal, &algo(), &exchange(), |_| {
            Ok(Some(TradeExecution::new(eth(dec!(2)), eos(dec!(200)))))
        });
        assert!(matches!(result, Err(Error::InvalidExecution(_))));
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_negative_execution_rejected() {
        let m = configured(dec!(1)).await;
        let before = m.get_all_funds(&exchange(), &algo()).unwrap();

        let proposal = TradeProposal::new(eth(dec!(0.1))).unwrap();
        let result = m.queue_trade(&proposal, &algo(), &exchange(), |_| {
            Ok(Some(TradeExecution::new(eth(dec!(-5)), eos(dec!(-3)))))
        });
        assert!(matches!(result, Err(Error::InvalidExecution(_))));
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);

        let update = TradeExecution::new(eth(dec!(0.1)), eos(dec!(-1)));
        assert!(m.update_allocation(&exchange(), &algo(), &update).is_err());
        assert_eq!(m.get_all_funds(&exchange(), &algo()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_proposals_cannot_double_spend() {
        let m = Arc::new(configured(dec!(1)).await);
        let accepted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    let proposal = TradeProposal::new(eth(dec!(0.6))).unwrap();
                    let ok = m
                        .queue_trade(&proposal, &algo(), &exchange(), |p| {
                            Ok(Some(TradeExecution::new(p.from().clone(), eos(dec!(60)))))
                        })
                        .unwrap();
                    if ok {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        let eth_left = m
            .get_available_funds(&exchange(), &algo(), &Currency::new("ETH"))
            .unwrap();
        assert_eq!(eth_left.free, dec!(0.4));
    }

    #[tokio::test]
    async fn test_resync_reports_unallocated_funds() {
        let fetcher = Arc::new(StaticPortfolioFetcher::with(
            exchange(),
            Portfolio::new([eth(dec!(10))]),
        ));
        let m = AllocationManager::new(fetcher.clone());
        m.set_initial_configuration(weights(dec!(0.5))).await.unwrap();

        let diff = m.resync(&exchange()).await.unwrap();
        assert_eq!(diff, vec![eth(dec!(5))]);

        fetcher.set_portfolio(exchange(), Portfolio::new([eth(dec!(4))]));
        let diff = m.resync(&exchange()).await.unwrap();
        assert_eq!(diff, vec![eth(dec!(-1))]);
    }
}
