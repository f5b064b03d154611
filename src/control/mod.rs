//! Control plane - Named administrative commands with a fixed argument schema
//!
//! The plane only parses and dispatches; the work happens in a [`ControlTarget`].

pub mod command;
pub mod response;

pub use command::Command;
pub use response::{Response, ResponseKind};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{AlgorithmId, AllocationWeights, Balance, Currency, Exchange, Portfolio, Result};

/// Administrative operations the core exposes to operators
#[async_trait]
pub trait ControlTarget: Send + Sync {
    /// Halt every algorithm
    async fn stop_bot(&self) -> Result<()>;

    async fn stop_algorithm(&self, algorithm: &AlgorithmId) -> Result<()>;

    fn allocation(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<Portfolio>;

    /// Worth of an algorithm's sub-portfolio in the current base currency
    async fn valuation(&self, exchange: &Exchange, algorithm: &AlgorithmId) -> Result<(Currency, Decimal)>;

    fn allocation_weights(&self) -> AllocationWeights;

    /// Replace the allocation configuration wholesale
    async fn reconfigure_allocation(&self, weights: AllocationWeights) -> Result<()>;

    fn set_base_currency(&self, currency: Currency) -> Result<()>;
}

pub struct ControlPlane {
    target: Arc<dyn ControlTarget>,
}

impl ControlPlane {
    pub fn new(target: Arc<dyn ControlTarget>) -> Self {
        Self { target }
    }

    /// Parse and run one JSON command message
    pub async fn handle(&self, message: &str) -> Response {
        let command = match command::parse(message) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected control message: {}", e);
                return Response::error(e.to_string());
            }
        };

        info!(?command, "Control command");
        match self.execute(command).await {
            Ok(message) => Response::success(message),
            Err(e) => {
                warn!("Control command failed: {}", e);
                Response::failure(e.to_string())
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<String> {
        match command {
            Command::Help => Ok(command::help()),
            Command::StopBot => {
                self.target.stop_bot().await?;
                Ok("All algorithms stopped".to_string())
            }
            Command::StopAlgorithm { algorithm } => {
                self.target.stop_algorithm(&algorithm).await?;
                Ok(format!("Algorithm {} stopped", algorithm))
            }
            Command::GetAllocation { exchange, algorithm } => {
                let portfolio = self.target.allocation(&exchange, &algorithm)?;
                let balances: Vec<&Balance> = portfolio.balances().filter(|b| !b.is_zero()).collect();
                let mut report = json!({ "balances": balances });
                match self.target.valuation(&exchange, &algorithm).await {
                    Ok((base, value)) => {
                        report["base_currency"] = json!(base);
                        report["value"] = json!(value);
                    }
                    Err(e) => warn!(%algorithm, %exchange, "Allocation not valued: {}", e),
                }
                Ok(report.to_string())
            }
            Command::SetAllocation {
                exchange,
                algorithm,
                weight,
            } => {
                let mut weights = self.target.allocation_weights();
                set_weight(&mut weights, exchange.clone(), algorithm.clone(), weight);
                self.target.reconfigure_allocation(weights).await?;
                Ok(format!("Weight of {} on {} set to {}", algorithm, exchange, weight))
            }
            Command::ChangeBaseCurrency { currency } => {
                self.target.set_base_currency(currency.clone())?;
                Ok(format!("Base currency changed to {}", currency))
            }
        }
    }
}

fn set_weight(weights: &mut AllocationWeights, exchange: Exchange, algorithm: AlgorithmId, weight: Decimal) {
    weights.entry(exchange).or_default().insert(algorithm, weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct Recorder {
        stopped: Mutex<Vec<AlgorithmId>>,
        weights: Mutex<AllocationWeights>,
        base: Mutex<Option<Currency>>,
    }

    #[async_trait]
    impl ControlTarget for Recorder {
        async fn stop_bot(&self) -> Result<()> {
            self.stopped.lock().push(AlgorithmId::new("*"));
            Ok(())
        }

        async fn stop_algorithm(&self, algorithm: &AlgorithmId) -> Result<()> {
            if algorithm.as_str() == "ghost" {
                return Err(Error::InvalidArgument("unknown algorithm ghost".to_string()));
            }
            self.stopped.lock().push(algorithm.clone());
            Ok(())
        }

        fn allocation(&self, _: &Exchange, _: &AlgorithmId) -> Result<Portfolio> {
            Ok(Portfolio::new([
                Balance::new(Currency::new("EOS"), dec!(100), Decimal::ZERO),
                Balance::new(Currency::new("ETH"), Decimal::ZERO, Decimal::ZERO),
            ]))
        }

        async fn valuation(&self, _: &Exchange, algorithm: &AlgorithmId) -> Result<(Currency, Decimal)> {
            if algorithm.as_str() == "unpriced" {
                return Err(Error::OutOfData("no EOS market".to_string()));
            }
            let base = self.base.lock().clone().unwrap_or_else(|| Currency::new("ETH"));
            Ok((base, dec!(1.5)))
        }

        fn allocation_weights(&self) -> AllocationWeights {
            self.weights.lock().clone()
        }

        async fn reconfigure_allocation(&self, weights: AllocationWeights) -> Result<()> {
            crate::core::config::validate_weights(&weights)?;
            *self.weights.lock() = weights;
            Ok(())
        }

        fn set_base_currency(&self, currency: Currency) -> Result<()> {
            *self.base.lock() = Some(currency);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commands_reach_target() {
        let target = Arc::new(Recorder::default());
        let plane = ControlPlane::new(target.clone());

        let response = plane.handle(r#"{"command":"stop_algorithm","arg_algorithm":"bw"}"#).await;
        assert_eq!(response.result, ResponseKind::Success);
        assert_eq!(*target.stopped.lock(), vec![AlgorithmId::new("bw")]);

        let response = plane.handle(r#"{"command":"change_basecurrency","arg_currency":"BNB"}"#).await;
        assert_eq!(response.result, ResponseKind::Success);
        assert_eq!(*target.base.lock(), Some(Currency::new("BNB")));

        let response = plane
            .handle(r#"{"command":"set_allocation","arg_exchange":"binance","arg_algorithm":"bw","arg_weight":"0.3"}"#)
            .await;
        assert_eq!(response.result, ResponseKind::Success);
        assert_eq!(
            target.weights.lock()[&Exchange::new("binance")][&AlgorithmId::new("bw")],
            dec!(0.3)
        );
    }

    #[tokio::test]
    async fn test_error_and_failure_envelopes() {
        let plane = ControlPlane::new(Arc::new(Recorder::default()));

        let response = plane.handle(r#"{"command":"stop_algorithm"}"#).await;
        assert_eq!(response.result, ResponseKind::Error);

        let response = plane.handle(r#"{"command":"stop_algorithm","arg_algorithm":"ghost"}"#).await;
        assert_eq!(response.result, ResponseKind::Failure);

        let response = plane
            .handle(r#"{"command":"set_allocation","arg_exchange":"binance","arg_algorithm":"bw","arg_weight":"1.5"}"#)
            .await;
        assert_eq!(response.result, ResponseKind::Failure);
    }

    #[tokio::test]
    async fn test_get_allocation_reports_value_in_base_currency() {
        let target = Arc::new(Recorder::default());
        let plane = ControlPlane::new(target.clone());
        let request = r#"{"command":"get_allocation","arg_exchange":"binance","arg_algorithm":"bw"}"#;

        let response = plane.handle(request).await;
        assert_eq!(response.result, ResponseKind::Success);
        let report: serde_json::Value = serde_json::from_str(&response.message).unwrap();
        assert_eq!(report["balances"].as_array().unwrap().len(), 1);
        assert_eq!(report["balances"][0]["currency"], "EOS");
        assert_eq!(report["base_currency"], "ETH");
        assert_eq!(report["value"], "1.5");

        plane.handle(r#"{"command":"change_basecurrency","arg_currency":"usdt"}"#).await;
        let report: serde_json::Value = serde_json::from_str(&plane.handle(request).await.message).unwrap();
        assert_eq!(report["base_currency"], "USDT");

        let response = plane
            .handle(r#"{"command":"get_allocation","arg_exchange":"binance","arg_algorithm":"unpriced"}"#)
            .await;
        assert_eq!(response.result, ResponseKind::Success);
        let report: serde_json::Value = serde_json::from_str(&response.message).unwrap();
        assert!(report.get("value").is_none());
    }

    #[tokio::test]
    async fn test_help() {
        let plane = ControlPlane::new(Arc::new(Recorder::default()));
        let response = plane.handle(r#"{"command":"help"}"#).await;
        assert_eq!(response.result, ResponseKind::Success);
        assert!(response.message.contains("change_basecurrency {arg_currency}"));
    }
}
