//! Portfolio fetchers - Source of the remote holdings

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{Error, Exchange, ExchangeClient, Portfolio, Result};

#[async_trait]
pub trait PortfolioFetcher: Send + Sync {
    /// Full holdings on `exchange`
    async fn get_portfolio(&self, exchange: &Exchange) -> Result<Portfolio>;
}

/// Fixed holdings per exchange (backtests, tests)
#[derive(Default)]
pub struct StaticPortfolioFetcher {
    portfolios: RwLock<BTreeMap<Exchange, Portfolio>>,
}

impl StaticPortfolioFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(exchange: Exchange, portfolio: Portfolio) -> Self {
        let fetcher = Self::new();
        fetcher.set_portfolio(exchange, portfolio);
        fetcher
    }

    pub fn set_portfolio(&self, exchange: Exchange, portfolio: Portfolio) {
        self.portfolios.write().insert(exchange, portfolio);
    }
}

#[async_trait]
impl PortfolioFetcher for StaticPortfolioFetcher {
    async fn get_portfolio(&self, exchange: &Exchange) -> Result<Portfolio> {
        self.portfolios
            .read()
            .get(exchange)
            .cloned()
            .ok_or_else(|| Error::Communication(format!("No portfolio known for {}", exchange)))
    }
}

/// Asks the matching exchange client for its account holdings
pub struct ExchangePortfolioFetcher {
    clients: BTreeMap<Exchange, Arc<dyn ExchangeClient>>,
}

impl ExchangePortfolioFetcher {
    pub fn new(clients: impl IntoIterator<Item = Arc<dyn ExchangeClient>>) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.exchange(), c)).collect(),
        }
    }
}

#[async_trait]
impl PortfolioFetcher for ExchangePortfolioFetcher {
    async fn get_portfolio(&self, exchange: &Exchange) -> Result<Portfolio> {
        let client = self
            .clients
            .get(exchange)
            .ok_or_else(|| Error::Config(format!("No client configured for {}", exchange)))?;
        client.fetch_portfolio().await
    }
}
