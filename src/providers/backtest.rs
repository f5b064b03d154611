//! Backtest providers - Candle replay against a virtual clock
//!
//! Only candles that have closed at the current virtual time are visible.
//! Fills happen immediately at the latest close and land in the [`Ledger`].

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use super::{DataProvider, OrderExecutor, check_candle_count, performance, window_start};
use crate::core::{
    Candle, Currency, Error, OrderSide, OrderStatus, OrderType, OrderUpdate, Result, TradingPair,
};
use crate::timer::VirtualClock;

/// Historical candles per pair, oldest first, all of one width
#[derive(Debug, Clone)]
pub struct CandleStore {
    width: Duration,
    candles: BTreeMap<String, Vec<Candle>>,
}

impl CandleStore {
    /// Candles keyed by pair symbol (e.g. "EOSETH"); each series is sorted by open time
    pub fn new(width: Duration, candles: BTreeMap<String, Vec<Candle>>) -> Result<Self> {
        if width <= Duration::zero() {
            return Err(Error::Config("candle width must be positive".to_string()));
        }
        let mut candles = candles;
        for series in candles.values_mut() {
            series.sort_by_key(|c| c.timestamp);
            series.dedup_by_key(|c| c.timestamp);
        }
        Ok(Self { width, candles })
    }

    /// Load `pair,timestamp,open,high,low,close,volume` rows
    pub fn load_csv(path: &Path, width: Duration) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut candles: BTreeMap<String, Vec<Candle>> = BTreeMap::new();

        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let field = |i: usize, name: &str| {
                row.get(i)
                    .map(str::trim)
                    .ok_or_else(|| Error::Config(format!("candle row {} misses {}", line + 1, name)))
            };
            let decimal = |i: usize, name: &str| -> Result<Decimal> {
                let raw = field(i, name)?;
                Decimal::from_str(raw)
                    .map_err(|e| Error::Config(format!("candle row {} has bad {} '{}': {}", line + 1, name, raw, e)))
            };

            let pair = TradingPair::parse(field(0, "pair")?, 0)?;
            let candle = Candle {
                timestamp: parse_timestamp(field(1, "timestamp")?)?,
                open: decimal(2, "open")?,
                high: decimal(3, "high")?,
                low: decimal(4, "low")?,
                close: decimal(5, "close")?,
                volume: decimal(6, "volume")?,
            };
            candles.entry(pair.to_string()).or_default().push(candle);
        }

        info!(
            path = %path.display(),
            pairs = candles.len(),
            candles = candles.values().map(Vec::len).sum::<usize>(),
            "Loaded backtest candles"
        );
        Self::new(width, candles)
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    fn series(&self, pair: &TradingPair) -> Result<&[Candle]> {
        self.candles
            .get(&pair.to_string())
            .map(Vec::as_slice)
            .ok_or_else(|| Error::OutOfData(format!("no candles for {}", pair)))
    }

    /// Latest candle closed at or before `now`
    pub fn latest_closed(&self, pair: &TradingPair, now: DateTime<Utc>) -> Result<&Candle> {
        let series = self.series(pair)?;
        let closed = series.partition_point(|c| c.close_time(self.width) <= now);
        closed
            .checked_sub(1)
            .and_then(|i| series.get(i))
            .ok_or_else(|| Error::OutOfData(format!("no closed {} candle at {}", pair, now)))
    }

    /// The last `count` candles closed at or before `now`, oldest first
    pub fn recent(&self, pair: &TradingPair, now: DateTime<Utc>, count: usize) -> Result<&[Candle]> {
        let series = self.series(pair)?;
        let closed = series.partition_point(|c| c.close_time(self.width) <= now);
        closed
            .checked_sub(count)
            .map(|from| &series[from..closed])
            .ok_or_else(|| {
                Error::OutOfData(format!(
                    "{} has {} closed candles at {} but {} were requested",
                    pair, closed, now, count
                ))
            })
    }

    /// Candles opening at or after `start` and closing at or before `end`
    pub fn window(&self, pair: &TradingPair, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<&[Candle]> {
        let series = self.series(pair)?;
        let from = series.partition_point(|c| c.timestamp < start);
        let to = series.partition_point(|c| c.close_time(self.width) <= end);
        Ok(if from < to { &series[from..to] } else { &[] })
    }

    /// Every distinct candle close time, ascending
    pub fn close_times(&self) -> Vec<DateTime<Utc>> {
        let mut times: Vec<DateTime<Utc>> = self
            .candles
            .values()
            .flatten()
            .map(|c| c.close_time(self.width))
            .collect();
        times.sort();
        times.dedup();
        times
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| Error::Config(format!("timestamp {} out of range", millis)));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("bad timestamp '{}': {}", raw, e)))
}

/// Market data as of the virtual clock, never beyond it
pub struct BacktestDataProvider {
    store: Arc<CandleStore>,
    clock: VirtualClock,
}

impl BacktestDataProvider {
    pub fn new(store: Arc<CandleStore>, clock: VirtualClock) -> Self {
        Self { store, clock }
    }

    fn close(&self, pair: &TradingPair) -> Result<Decimal> {
        Ok(self.store.latest_closed(pair, self.clock.now())?.close)
    }
}

impl DataProvider for BacktestDataProvider {
    fn current_price_last_trade(&self, pair: &TradingPair) -> Result<Decimal> {
        self.close(pair)
    }

    fn current_price_top_bid(&self, pair: &TradingPair) -> Result<Decimal> {
        self.close(pair)
    }

    fn current_price_top_ask(&self, pair: &TradingPair) -> Result<Decimal> {
        self.close(pair)
    }

    fn performance_past_hours(
        &self,
        pair: &TradingPair,
        hours_back: f64,
        end_time: DateTime<Utc>,
    ) -> Result<Decimal> {
        let start = window_start(end_time, hours_back)?;
        let now = self.clock.now();
        if end_time > now {
            return Err(Error::InvalidArgument(format!(
                "end time {} lies beyond the backtest clock {}",
                end_time, now
            )));
        }
        let candles = self.store.window(pair, start, end_time)?;
        performance(pair, candles)
    }

    fn candles(&self, pair: &TradingPair, count: usize) -> Result<Vec<Candle>> {
        check_candle_count(count)?;
        let recent = self.store.recent(pair, self.clock.now(), count)?;
        Ok(recent.iter().rev().cloned().collect())
    }
}

/// One simulated fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub timestamp: DateTime<Utc>,
    pub base: Currency,
    pub quote: Currency,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee_asset: Currency,
    pub fee: Decimal,
}

/// CSV sink for ledger records, one row per call
pub struct LedgerWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> LedgerWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(inner),
        }
    }

    pub fn write(&mut self, record: &LedgerRecord) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
    }
}

impl LedgerWriter<std::fs::File> {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(std::fs::File::create(path)?))
    }
}

type Sink = Box<dyn Write + Send>;

/// Trade ledger of a backtest run, shared by all algorithms
#[derive(Default)]
pub struct Ledger {
    records: Mutex<Vec<LedgerRecord>>,
    sink: Mutex<Option<LedgerWriter<Sink>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also stream every record to `sink`
    pub fn with_sink(sink: Sink) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            sink: Mutex::new(Some(LedgerWriter::new(sink))),
        }
    }

    pub fn record(&self, record: LedgerRecord) -> Result<()> {
        if let Some(writer) = self.sink.lock().as_mut() {
            writer.write(&record)?;
        }
        self.records.lock().push(record);
        Ok(())
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records.lock().clone()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = self.sink.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Fills market orders at the latest close, charging `fee_rate` of the received asset
pub struct BacktestOrderExecutor {
    data: Arc<BacktestDataProvider>,
    ledger: Arc<Ledger>,
    fee_rate: Decimal,
    next_id: AtomicU64,
}

impl BacktestOrderExecutor {
    pub fn new(data: Arc<BacktestDataProvider>, ledger: Arc<Ledger>, fee_rate: Decimal) -> Self {
        Self {
            data,
            ledger,
            fee_rate,
            next_id: AtomicU64::new(1),
        }
    }
}

impl BacktestOrderExecutor {
    fn fill(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        set_price: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate> {
        let now = self.data.clock.now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (fee_asset, received) = match side {
            OrderSide::Buy => (pair.left.clone(), quantity),
            OrderSide::Sell => (pair.right.clone(), quantity * price),
        };
        let fee = received * self.fee_rate;

        let order = OrderUpdate::new(id, id, OrderStatus::New, order_type, now, side, pair.clone(), set_price, quantity)
            .filled(price, fee, fee_asset.clone());

        self.ledger.record(LedgerRecord {
            timestamp: now,
            base: pair.left.clone(),
            quote: pair.right.clone(),
            side,
            quantity,
            price,
            fee_asset,
            fee,
        })?;
        debug!(%pair, %side, %quantity, %price, %fee, "Simulated fill");
        Ok(order)
    }
}

impl OrderExecutor for BacktestOrderExecutor {
    fn execute_market_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderUpdate> {
        let price = self.data.current_price_last_trade(pair)?;
        self.fill(pair, side, OrderType::Market, quantity, price, price)
    }

    /// Fills at the latest close when the limit crosses it; there is no book to rest on
    fn execute_limit_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderUpdate> {
        let close = self.data.current_price_last_trade(pair)?;
        let marketable = match side {
            OrderSide::Buy => close <= price,
            OrderSide::Sell => close >= price,
        };
        if !marketable {
            return Err(Error::InvalidArgument(format!(
                "{} limit on {} at {} does not cross the last close {}",
                side, pair, price, close
            )));
        }
        self.fill(pair, side, OrderType::Limit, quantity, price, close)
    }

    fn cancel_order(&self, pair: &TradingPair, order_id: u64) -> Result<OrderUpdate> {
        Err(Error::InvalidArgument(format!(
            "order {} on {} is not open; backtest orders fill immediately",
            order_id, pair
        )))
    }
}
