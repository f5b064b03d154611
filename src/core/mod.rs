//! Core module - Common types, config, events and error handling

pub mod error;
pub mod types;
pub mod config;
pub mod observable;
pub mod traits;

pub use error::{Error, Result};
pub use types::*;
pub use traits::ExchangeClient;
pub use config::{AppConfig, RunMode};
pub use observable::{Observable, Subscription};
