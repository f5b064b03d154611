//! Tranche - Core Library
//! Multi-algorithm trading runtime with shared-capital allocation and deterministic backtesting

// Public modules
pub mod core;
pub mod timer;
pub mod providers;
pub mod allocation;
pub mod algorithm;
pub mod control;
pub mod engine;

// Re-exports
pub use core::{AppConfig, Error, Result};
