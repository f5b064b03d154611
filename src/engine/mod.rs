//! Engines - Wire configuration, allocation and providers into running algorithms

pub mod backtest;
pub mod live;

pub use backtest::{BacktestEngine, BacktestReport};
pub use live::LiveEngine;
