//! Per-algorithm view of the allocation manager

use std::sync::Arc;

use super::manager::AllocationManager;
use crate::core::{
    AlgorithmId, Balance, Currency, Exchange, Portfolio, Result, TradeExecution, TradeProposal,
};

/// Capability-narrowed facade bound to one (algorithm, exchange); holds no state of its own
#[derive(Clone)]
pub struct WeakAllocationManager {
    manager: Arc<AllocationManager>,
    algorithm: AlgorithmId,
    exchange: Exchange,
}

impl WeakAllocationManager {
    pub(crate) fn new(manager: Arc<AllocationManager>, algorithm: AlgorithmId, exchange: Exchange) -> Self {
        Self {
            manager,
            algorithm,
            exchange,
        }
    }

    pub fn algorithm(&self) -> &AlgorithmId {
        &self.algorithm
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn get_available_funds(&self, currency: &Currency) -> Result<Balance> {
        self.manager
            .get_available_funds(&self.exchange, &self.algorithm, currency)
    }

    pub fn get_all_funds(&self) -> Result<Portfolio> {
        self.manager.get_all_funds(&self.exchange, &self.algorithm)
    }

    pub fn queue_trade<F>(&self, proposal: &TradeProposal, callback: F) -> Result<bool>
    where
        F: FnOnce(&TradeProposal) -> Result<Option<TradeExecution>>,
    {
        self.manager
            .queue_trade(proposal, &self.algorithm, &self.exchange, callback)
    }

    /// Apply an execution reported after placement (fills, releases)
    pub fn update_allocation(&self, execution: &TradeExecution) -> Result<()> {
        self.manager
            .update_allocation(&self.exchange, &self.algorithm, execution)
    }
}

impl std::fmt::Debug for WeakAllocationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakAllocationManager")
            .field("algorithm", &self.algorithm)
            .field("exchange", &self.exchange)
            .finish()
    }
}
