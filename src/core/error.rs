//! Error handling - One hierarchy for the whole runtime

use thiserror::Error;

use crate::core::types::{AlgorithmId, Exchange};

pub type Result<T> = std::result::Result<T, Error>;

/// Tranche error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Allocation queried or traded before `set_initial_configuration`
    #[error("Allocation manager is not configured: {0}")]
    NotConfigured(String),

    /// Argument outside its accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Negative timer duration
    #[error("Timer duration out of range: {0}")]
    TimerRange(String),

    /// A state violated the handler contract
    #[error("Algorithm logic error: {0}")]
    AlgorithmLogic(String),

    /// Exchange collaborator unreachable or answered with an error payload
    #[error("Communication error: {0}")]
    Communication(String),

    /// No sub-allocation exists for this pair
    #[error("No allocation for algorithm {algorithm} on {exchange}")]
    UnknownAllocation {
        exchange: Exchange,
        algorithm: AlgorithmId,
    },

    /// A trade execution could not be applied to a portfolio
    #[error("Invalid trade execution: {0}")]
    InvalidExecution(String),

    /// Backtest data does not cover the requested moment
    #[error("Backtest out of data: {0}")]
    OutOfData(String),

    /// Algorithm runtime no longer accepts events
    #[error("Algorithm {0} is halted")]
    Halted(AlgorithmId),

    /// Malformed control-plane command
    #[error("Command error: {0}")]
    Command(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// CSV errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
