use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tranche::AppConfig;
use tranche::control::{ControlPlane, ResponseKind};
use tranche::core::{
    AlgorithmId, Balance, Candle, Currency, Exchange, ExchangeClient, Observable, OrderSide,
    OrderStatus, OrderType, OrderUpdate, Portfolio, Result, Ticker, TradingPair,
};
use tranche::engine::LiveEngine;

/// In-memory exchange whose market dipped 3% over the last hours
struct PaperExchange {
    updates: Observable<OrderUpdate>,
    orders: Mutex<Vec<OrderUpdate>>,
    next_id: AtomicU64,
    fill_before_ack: bool,
}

impl PaperExchange {
    fn new() -> Self {
        Self {
            updates: Observable::new(),
            orders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(42),
            fill_before_ack: false,
        }
    }

    /// Publishes the fill of every order before acknowledging its placement
    fn filling_before_ack() -> Self {
        Self {
            fill_before_ack: true,
            ..Self::new()
        }
    }

    fn orders(&self) -> Vec<OrderUpdate> {
        self.orders.lock().clone()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn exchange(&self) -> Exchange {
        Exchange::new("paper")
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_ticker(&self, pair: &TradingPair) -> Result<Ticker> {
        Ok(Ticker {
            pair: pair.clone(),
            last: dec!(0.01),
            bid: dec!(0.01),
            ask: dec!(0.01),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_candles(
        &self,
        _: &TradingPair,
        start: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let candle = |offset: i64, open: Decimal, close: Decimal| Candle {
            timestamp: start + ChronoDuration::hours(offset),
            open,
            high: open,
            low: close,
            close,
            volume: dec!(1000),
        };
        Ok(vec![candle(0, dec!(0.0103), dec!(0.0101)), candle(1, dec!(0.0101), dec!(0.01))])
    }

    async fn place_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderUpdate> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = OrderUpdate::new(
            id,
            id,
            OrderStatus::New,
            OrderType::Market,
            Utc::now(),
            side,
            pair.clone(),
            dec!(0.01),
            quantity,
        );
        self.orders.lock().push(order.clone());
        if self.fill_before_ack {
            self.updates
                .publish(&order.clone().filled(dec!(0.01), Decimal::ZERO, pair.left.clone()));
        }
        Ok(order)
    }

    async fn place_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderUpdate::new(
            id,
            id,
            OrderStatus::New,
            OrderType::Limit,
            Utc::now(),
            side,
            pair.clone(),
            price,
            quantity,
        ))
    }

    async fn cancel_order(&self, _: &TradingPair, order_id: u64) -> Result<OrderUpdate> {
        Err(tranche::Error::InvalidArgument(format!("order {} unknown", order_id)))
    }

    async fn fetch_portfolio(&self) -> Result<Portfolio> {
        Ok(Portfolio::new([Balance::new(Currency::new("ETH"), dec!(2), Decimal::ZERO)]))
    }

    fn order_updates(&self) -> Observable<OrderUpdate> {
        self.updates.clone()
    }
}

const CONFIG: &str = r#"
[app]
mode = "live"
log_level = "warn"
poll_interval_secs = 1

[allocation.paper]
bw = "0.5"

[[algorithms]]
id = "bw"
kind = "bandwagon"
exchange = "paper"
pairs = ["EOS/ETH"]
"#;

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_engine_trades_and_answers_control_commands() {
    let exchange = Arc::new(PaperExchange::new());
    let config = AppConfig::parse(CONFIG).unwrap();
    let engine = LiveEngine::new(config, vec![exchange.clone() as Arc<dyn ExchangeClient>])
        .await
        .unwrap();
    engine.start().unwrap();
    assert_eq!(exchange.updates.subscriber_count(), 1);

    let algorithm = AlgorithmId::new("bw");
    wait_for(|| !exchange.orders().is_empty()).await;
    let status = engine.status(&algorithm).unwrap();
    wait_for(|| status.current_state() == "BuyState").await;

    // Half of 2 ETH spent on 100 EOS
    let placed = exchange.orders()[0].clone();
    assert_eq!(placed.side, OrderSide::Buy);
    assert_eq!(placed.set_quantity, dec!(100));
    let funds = engine
        .allocation_manager()
        .get_all_funds(&Exchange::new("paper"), &algorithm)
        .unwrap();
    assert_eq!(funds.allocation(&Currency::new("EOS")).free, dec!(100));
    assert!(funds.allocation(&Currency::new("ETH")).is_zero());

    // Fill event reaches the buying state without halting it
    exchange
        .updates
        .publish(&placed.clone().filled(dec!(0.01), Decimal::ZERO, Currency::new("EOS")));
    wait_for(|| status.order_updates() == 1).await;
    assert!(!status.is_halted());
    assert_eq!(status.current_state(), "BuyState");

    let plane = ControlPlane::new(engine.clone());
    let get_allocation = r#"{"command":"get_allocation","arg_exchange":"paper","arg_algorithm":"bw"}"#;
    let response = plane.handle(get_allocation).await;
    assert_eq!(response.result, ResponseKind::Success);
    assert!(response.message.contains("EOS"));
    let report: serde_json::Value = serde_json::from_str(&response.message).unwrap();
    assert_eq!(report["base_currency"], "ETH");
    assert_eq!(Decimal::from_str(report["value"].as_str().unwrap()).unwrap(), dec!(1));

    let response = plane.handle(r#"{"command":"change_basecurrency","arg_currency":"usdt"}"#).await;
    assert_eq!(response.result, ResponseKind::Success);
    assert_eq!(engine.base_currency(), Currency::new("USDT"));
    let report: serde_json::Value =
        serde_json::from_str(&plane.handle(get_allocation).await.message).unwrap();
    assert_eq!(report["base_currency"], "USDT");

    let response = plane.handle(r#"{"command":"stop_algorithm","arg_algorithm":"ghost"}"#).await;
    assert_eq!(response.result, ResponseKind::Failure);

    let response = plane.handle(r#"{"command":"stop_algorithm","arg_algorithm":"bw"}"#).await;
    assert_eq!(response.result, ResponseKind::Success);
    assert!(engine.running().is_empty());

    let response = plane.handle(r#"{"command":"stop_bot"}"#).await;
    assert_eq!(response.result, ResponseKind::Success);
    assert_eq!(exchange.updates.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fill_published_before_acknowledgement_is_delivered() {
    let exchange = Arc::new(PaperExchange::filling_before_ack());
    let config = AppConfig::parse(CONFIG).unwrap();
    let engine = LiveEngine::new(config, vec![exchange.clone() as Arc<dyn ExchangeClient>])
        .await
        .unwrap();
    engine.start().unwrap();

    let status = engine.status(&AlgorithmId::new("bw")).unwrap();
    wait_for(|| status.order_updates() == 1).await;
    assert_eq!(exchange.orders().len(), 1);
    assert!(!status.is_halted());
    wait_for(|| status.current_state() == "BuyState").await;

    engine.halt_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_allocation_reconfigures_wholesale() {
    let exchange = Arc::new(PaperExchange::new());
    let config = AppConfig::parse(CONFIG).unwrap();
    let engine = LiveEngine::new(config, vec![exchange as Arc<dyn ExchangeClient>]).await.unwrap();
    let plane = ControlPlane::new(engine.clone());

    let response = plane
        .handle(r#"{"command":"set_allocation","arg_exchange":"paper","arg_algorithm":"bw","arg_weight":"0.25"}"#)
        .await;
    assert_eq!(response.result, ResponseKind::Success);
    let funds = engine
        .allocation_manager()
        .get_available_funds(&Exchange::new("paper"), &AlgorithmId::new("bw"), &Currency::new("ETH"))
        .unwrap();
    assert_eq!(funds.free, dec!(0.5));

    let response = plane
        .handle(r#"{"command":"set_allocation","arg_exchange":"paper","arg_algorithm":"other","arg_weight":"0.9"}"#)
        .await;
    assert_eq!(response.result, ResponseKind::Failure);
    assert_eq!(engine.allocation_manager().weights()[&Exchange::new("paper")].len(), 1);
}
