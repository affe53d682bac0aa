//! Bridge operator: reconciliation and payout engine of a two-chain token bridge
//!
//! Deposits into the bridge account on either chain are scanned into a request
//! ledger, priced from balance snapshots and paid out on the other chain at most once.

pub mod bridge;
pub mod chain;
pub mod config;
pub mod conversion;
pub mod db;
pub mod error;
pub mod metrics;
pub mod payout;
pub mod reconciler;
pub mod retry;
pub mod scanner;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeContext, CycleReport, WorkflowManager};
pub use config::Config;
pub use conversion::{ConversionFunction, ConversionRateCalculator, ConversionRateEngine, RateSource};
pub use error::{ConnectorError, ErrorKind, PayoutError, ScanError};
