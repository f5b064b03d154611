//! Live engine - One blocking task per algorithm against real exchanges
//!
//! Algorithms run on `spawn_blocking` threads and read their FIFO event
//! queue. A poll task sends market ticks; order updates published by the
//! exchange clients are routed to the algorithm that placed the order.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::algorithm::{RuntimeEvent, RuntimeServices, RuntimeStatus, registry};
use crate::allocation::{AllocationManager, ExchangePortfolioFetcher};
use crate::control::ControlTarget;
use crate::core::config::AlgorithmConfig;
use crate::core::{
    AlgorithmId, AllocationWeights, AppConfig, Currency, Error, Exchange, ExchangeClient,
    OrderUpdate, Portfolio, Result, RunMode, Subscription,
};
use crate::providers::{DataProvider, ExchangeProviders, LiveDataProvider, LiveOrderExecutor, OrderRouter};
use crate::timer::LiveTimer;

struct RunningAlgorithm {
    exchange: Exchange,
    sender: flume::Sender<RuntimeEvent>,
    status: Arc<RuntimeStatus>,
    task: JoinHandle<()>,
}

pub struct LiveEngine {
    config: AppConfig,
    handle: Handle,
    clients: BTreeMap<Exchange, Arc<dyn ExchangeClient>>,
    allocation: Arc<AllocationManager>,
    router: OrderRouter,
    algorithms: RwLock<BTreeMap<AlgorithmId, RunningAlgorithm>>,
    subscriptions: Mutex<Vec<Subscription>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    base_currency: RwLock<Currency>,
}

impl LiveEngine {
    /// Connect every client and split their portfolios by the configured weights
    pub async fn new(config: AppConfig, clients: Vec<Arc<dyn ExchangeClient>>) -> Result<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("Live engine needs a tokio runtime: {}", e)))?;

        for client in &clients {
            client.connect().await?;
            info!(exchange = %client.exchange(), "Exchange connected");
        }

        let allocation = Arc::new(AllocationManager::new(Arc::new(ExchangePortfolioFetcher::new(
            clients.iter().cloned(),
        ))));
        allocation.set_initial_configuration(config.weights()).await?;

        Ok(Arc::new(Self {
            handle,
            clients: clients.into_iter().map(|c| (c.exchange(), c)).collect(),
            allocation,
            router: OrderRouter::new(),
            algorithms: RwLock::new(BTreeMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            base_currency: RwLock::new(Currency::new(config.app.base_currency.as_str())),
            config,
        }))
    }

    /// Subscribe to order updates, launch every configured algorithm and start polling
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut subscriptions = self.subscriptions.lock();
            for client in self.clients.values() {
                let engine: Weak<Self> = Arc::downgrade(self);
                subscriptions.push(client.order_updates().subscribe(move |update: &OrderUpdate| {
                    if let Some(engine) = engine.upgrade() {
                        engine.route_order_update(update);
                    }
                }));
            }
        }

        for algorithm in &self.config.algorithms {
            self.start_algorithm(algorithm)?;
        }

        let engine = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.app.poll_interval_secs);
        let poller = self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.tick();
            }
        });
        *self.poller.lock() = Some(poller);

        info!(algorithms = self.algorithms.read().len(), "Live engine started");
        Ok(())
    }

    /// Build and launch one algorithm on its own blocking thread
    pub fn start_algorithm(&self, config: &AlgorithmConfig) -> Result<()> {
        let id = config.algorithm_id();
        let exchange = config.exchange();
        if self.algorithms.read().contains_key(&id) {
            return Err(Error::InvalidArgument(format!("Algorithm {} is already running", id)));
        }
        let client = self
            .clients
            .get(&exchange)
            .ok_or_else(|| Error::Config(format!("No client configured for {}", exchange)))?;
        let data = self.data_provider(&exchange)?;

        let providers = ExchangeProviders {
            exchange: exchange.clone(),
            mode: RunMode::Live,
            data,
            executor: Arc::new(LiveOrderExecutor::new(Arc::clone(client), self.handle.clone())),
            router: Some(self.router.clone()),
        };
        let services = RuntimeServices {
            trading: providers.trading_for(self.allocation.weak(id.clone(), exchange.clone())),
            algorithm: id.clone(),
            exchange: exchange.clone(),
            mode: providers.mode,
            data: Arc::clone(&providers.data),
            timer: Arc::new(LiveTimer::new(self.handle.clone())),
        };
        let mut runtime = registry::build(config, services)?;
        let sender = runtime.sender();
        let status = runtime.status();
        self.router.attach(id.clone(), sender.clone());

        let task = self.handle.spawn_blocking(move || {
            if let Err(e) = runtime.start() {
                error!(algorithm = %runtime.algorithm(), "Algorithm failed to start: {}", e);
                return;
            }
            runtime.run_blocking();
        });

        info!(algorithm = %id, %exchange, kind = %config.kind, "Algorithm launched");
        self.algorithms.write().insert(
            id,
            RunningAlgorithm {
                exchange,
                sender,
                status,
                task,
            },
        );
        Ok(())
    }

    /// Send a market tick to every algorithm that is still running
    pub fn tick(&self) {
        for (id, running) in self.algorithms.read().iter() {
            if running.status.is_halted() {
                continue;
            }
            if running.sender.send(RuntimeEvent::MarketTick).is_err() {
                debug!(algorithm = %id, "Algorithm queue closed");
            }
        }
    }

    /// Deliver an exchange order update to the algorithm that placed the order
    pub fn route_order_update(&self, update: &OrderUpdate) {
        self.router.dispatch(update);
    }

    pub fn status(&self, algorithm: &AlgorithmId) -> Option<Arc<RuntimeStatus>> {
        self.algorithms.read().get(algorithm).map(|r| Arc::clone(&r.status))
    }

    pub fn running(&self) -> Vec<AlgorithmId> {
        self.algorithms
            .read()
            .iter()
            .filter(|(_, r)| !r.status.is_halted() && !r.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn allocation_manager(&self) -> &Arc<AllocationManager> {
        &self.allocation
    }

    pub fn base_currency(&self) -> Currency {
        self.base_currency.read().clone()
    }

    fn data_provider(&self, exchange: &Exchange) -> Result<Arc<LiveDataProvider>> {
        let client = self
            .clients
            .get(exchange)
            .ok_or_else(|| Error::InvalidArgument(format!("No client configured for {}", exchange)))?;
        Ok(Arc::new(LiveDataProvider::new(
            Arc::clone(client),
            self.handle.clone(),
            self.config.app.candle_width()?,
        )))
    }

    /// Shut one algorithm down and wait for its thread to finish
    pub async fn stop_algorithm(&self, algorithm: &AlgorithmId) -> Result<()> {
        let running = self
            .algorithms
            .write()
            .remove(algorithm)
            .ok_or_else(|| Error::InvalidArgument(format!("No running algorithm {}", algorithm)))?;

        self.router.detach(algorithm);
        let _ = running.sender.send(RuntimeEvent::Shutdown);
        running
            .task
            .await
            .map_err(|e| Error::AlgorithmLogic(format!("algorithm {} thread failed: {}", algorithm, e)))?;
        info!(%algorithm, exchange = %running.exchange, "Algorithm stopped");
        Ok(())
    }

    /// Stop every algorithm, the poll task and all order-update subscriptions
    pub async fn halt_all(&self) -> Result<()> {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        self.subscriptions.lock().clear();

        let ids: Vec<AlgorithmId> = self.algorithms.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_algorithm(&id).await {
                warn!(algorithm = %id, "Failed to stop cleanly: {}", e);
            }
        }
        info!("Live engine halted");
        Ok(())
    }
}

#[async_trait]
impl ControlTarget for LiveEngine {
    async fn stop_bot(&self) -> Result<()> {
        self.halt_all().await
    }

    async fn stop_algorithm(&self, algorithm: &AlgorithmId) -> Result<()> {
        LiveEngine::stop_algorithm(self, algorithm).await
    }

    fn allocation(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<Portfolio> {
        self.allocation.get_all_funds(exchange, algorithm)
    }

    async fn valuation(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<(Currency, Decimal)> {
        let portfolio = self.allocation.get_all_funds(exchange, algorithm)?;
        let data = self.data_provider(exchange)?;
        let base = self.base_currency();
        let quote = base.clone();
        let value = tokio::task::spawn_blocking(move || data.valuate_portfolio(&portfolio, &quote))
            .await
            .map_err(|e| Error::Communication(format!("valuation of {} failed: {}", algorithm, e)))??;
        Ok((base, value))
    }

    fn allocation_weights(&self) -> AllocationWeights {
        self.allocation.weights()
    }

    async fn reconfigure_allocation(&self, weights: AllocationWeights) -> Result<()> {
        self.allocation.set_initial_configuration(weights).await
    }

    fn set_base_currency(&self, currency: Currency) -> Result<()> {
        info!(%currency, "Base currency changed");
        *self.base_currency.write() = currency;
        Ok(())
    }
}
