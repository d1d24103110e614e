pub mod client;
pub mod error;

pub use client::{FuturesClient, Ticker24h};
pub use error::BrokerError;
