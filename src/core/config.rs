//! Configuration - Type-safe, validated config

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::core::types::{AlgorithmId, AllocationWeights, Currency, Exchange, Portfolio, Balance};
use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub app: AppSettings,

    /// Weight per algorithm, keyed by exchange
    #[serde(default)]
    pub allocation: BTreeMap<String, BTreeMap<String, Decimal>>,

    /// Algorithm instances, dispatched in this order
    #[serde(default)]
    pub algorithms: Vec<AlgorithmConfig>,

    /// Backtest replay settings
    pub backtest: Option<BacktestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Run mode: live or backtest
    pub mode: RunMode,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Market-condition poll period in live mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Currency portfolio values are reported in
    #[serde(default = "default_base_currency")]
    pub base_currency: String,

    /// Width of the candles live algorithms query
    #[serde(default = "default_candle_width")]
    pub candle_width_minutes: i64,
}

impl AppSettings {
    pub fn candle_width(&self) -> Result<chrono::Duration> {
        candle_width(self.candle_width_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Backtest,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::Backtest => write!(f, "backtest"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Unique instance id
    pub id: String,

    /// Registered algorithm kind (e.g. "bandwagon")
    pub kind: String,

    /// Exchange this instance trades on
    pub exchange: String,

    /// Algorithm specific parameters
    #[serde(flatten)]
    pub params: toml::Table,
}

impl AlgorithmConfig {
    pub fn algorithm_id(&self) -> AlgorithmId {
        AlgorithmId::new(self.id.clone())
    }

    pub fn exchange(&self) -> Exchange {
        Exchange::new(self.exchange.clone())
    }

    /// Deserialize the flattened parameters into a settings type
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("Invalid settings for algorithm {}: {}", self.id, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Virtual clock start (RFC 3339)
    pub start: DateTime<Utc>,

    /// Candle CSV (pair,timestamp,open,high,low,close,volume)
    pub candles: PathBuf,

    /// Ledger CSV output
    pub output: PathBuf,

    /// Fee charged on every simulated fill, in the received asset
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,

    /// Candle width
    #[serde(default = "default_candle_width")]
    pub candle_width_minutes: i64,

    /// Holdings the replay starts from
    #[serde(default)]
    pub initial_portfolio: BTreeMap<String, Decimal>,
}

impl BacktestConfig {
    pub fn candle_width(&self) -> Result<chrono::Duration> {
        candle_width(self.candle_width_minutes)
    }

    pub fn initial_portfolio(&self) -> Portfolio {
        Portfolio::new(
            self.initial_portfolio
                .iter()
                .map(|(c, amount)| Balance::new(Currency::new(c.as_str()), *amount, Decimal::ZERO)),
        )
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_base_currency() -> String {
    "ETH".to_string()
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}

fn default_candle_width() -> i64 {
    5
}

fn candle_width(minutes: i64) -> Result<chrono::Duration> {
    if minutes <= 0 {
        return Err(Error::Config(format!("candle_width_minutes must be positive but was {}", minutes)));
    }
    chrono::Duration::try_minutes(minutes)
        .ok_or_else(|| Error::Config(format!("candle_width_minutes = {} is out of range", minutes)))
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Allocation table with typed keys
    pub fn weights(&self) -> AllocationWeights {
        self.allocation
            .iter()
            .map(|(exchange, algorithms)| {
                (
                    Exchange::new(exchange.as_str()),
                    algorithms
                        .iter()
                        .map(|(algorithm, weight)| (AlgorithmId::new(algorithm.as_str()), *weight))
                        .collect(),
                )
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be positive".to_string()));
        }
        self.app.candle_width()?;

        validate_weights(&self.weights())?;

        let weights = self.weights();
        let mut seen = HashSet::new();
        for algorithm in &self.algorithms {
            if !seen.insert(algorithm.id.as_str()) {
                return Err(Error::Config(format!("Duplicate algorithm id {}", algorithm.id)));
            }
            let allocated = weights
                .get(&algorithm.exchange())
                .is_some_and(|w| w.contains_key(&algorithm.algorithm_id()));
            if !allocated {
                return Err(Error::Config(format!(
                    "Algorithm {} has no allocation on {}",
                    algorithm.id, algorithm.exchange
                )));
            }
        }

        if self.app.mode == RunMode::Backtest {
            let backtest = self
                .backtest
                .as_ref()
                .ok_or_else(|| Error::Config("Backtest mode requires a [backtest] section".to_string()))?;
            backtest.candle_width()?;
            if backtest.fee_rate.is_sign_negative() || backtest.fee_rate >= Decimal::ONE {
                return Err(Error::Config(format!(
                    "fee_rate should be in [0, 1) but was {}",
                    backtest.fee_rate
                )));
            }
        }

        Ok(())
    }
}

/// Every factor in (0, 1] and the factors of one exchange sum to at most 1
pub fn validate_weights(weights: &AllocationWeights) -> Result<()> {
    for (exchange, algorithms) in weights {
        let mut sum = Decimal::ZERO;
        for (algorithm, factor) in algorithms {
            if *factor <= Decimal::ZERO || *factor > Decimal::ONE {
                return Err(Error::Config(format!(
                    "Weight of {} on {} should be in (0, 1] but was {}",
                    algorithm, exchange, factor
                )));
            }
            sum += *factor;
        }
        if sum > Decimal::ONE {
            return Err(Error::Config(format!(
                "Weights on {} sum to {} which exceeds 1",
                exchange, sum
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
[app]
mode = "backtest"
log_level = "debug"

[allocation.backtest]
bandwagon_1 = 0.5
bandwagon_2 = 0.25

[[algorithms]]
id = "bandwagon_1"
kind = "bandwagon"
exchange = "backtest"
pairs = ["EOS/ETH", "TRX/ETH"]
hold_hours = 4

[[algorithms]]
id = "bandwagon_2"
kind = "bandwagon"
exchange = "backtest"
pairs = ["EOS/ETH"]

[backtest]
start = "2018-06-01T00:00:00Z"
candles = "data/candles.csv"
output = "ledger.csv"

[backtest.initial_portfolio]
ETH = "10"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.app.mode, RunMode::Backtest);
        assert_eq!(config.app.poll_interval_secs, 5);
        assert_eq!(config.algorithms.len(), 2);

        let weights = config.weights();
        assert_eq!(
            weights[&Exchange::new("backtest")][&AlgorithmId::new("bandwagon_1")],
            dec!(0.5)
        );

        let backtest = config.backtest.as_ref().unwrap();
        assert_eq!(backtest.fee_rate, dec!(0.001));
        assert_eq!(
            backtest.initial_portfolio().allocation(&Currency::new("ETH")).free,
            dec!(10)
        );
    }

    #[test]
    fn test_algorithm_settings_flattened() {
        #[derive(Deserialize)]
        struct Params {
            pairs: Vec<String>,
            hold_hours: i64,
        }

        let config = AppConfig::parse(SAMPLE).unwrap();
        let params: Params = config.algorithms[0].settings().unwrap();
        assert_eq!(params.pairs, vec!["EOS/ETH", "TRX/ETH"]);
        assert_eq!(params.hold_hours, 4);
    }

    #[test]
    fn test_weights_out_of_range() {
        for bad in ["-1", "-0.0001", "2.5", "0"] {
            let text = SAMPLE.replace("bandwagon_1 = 0.5", &format!("bandwagon_1 = {}", bad));
            assert!(AppConfig::parse(&text).is_err(), "weight {} accepted", bad);
        }
    }

    #[test]
    fn test_weight_sum_above_one() {
        let text = SAMPLE.replace("bandwagon_2 = 0.25", "bandwagon_2 = 0.75");
        assert!(matches!(AppConfig::parse(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_algorithm_without_allocation() {
        let text = SAMPLE.replace("bandwagon_2 = 0.25\n", "");
        assert!(AppConfig::parse(&text).is_err());
    }

    #[test]
    fn test_candle_width_bounds() {
        for bad in ["0", "-5", &i64::MAX.to_string()] {
            let text = SAMPLE.replace(
                "output = \"ledger.csv\"",
                &format!("output = \"ledger.csv\"\ncandle_width_minutes = {}", bad),
            );
            assert!(matches!(AppConfig::parse(&text), Err(Error::Config(_))), "width {} accepted", bad);
        }
        let config = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.app.candle_width().unwrap(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_backtest_mode_requires_section() {
        let end = SAMPLE.find("[backtest]").unwrap();
        assert!(AppConfig::parse(&SAMPLE[..end]).is_err());
    }
}
