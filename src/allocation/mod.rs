//! Capital allocation - Sub-portfolios per (exchange, algorithm) and trade admission

pub mod fetcher;
pub mod manager;
pub mod weak;

pub use fetcher::{ExchangePortfolioFetcher, PortfolioFetcher, StaticPortfolioFetcher};
pub use manager::AllocationManager;
pub use weak::WeakAllocationManager;
