//! Interface to the blockchain nodes of both bridge sides
//!
//! The wire-level clients live outside this crate; the workflows only see the
//! [`ChainConnector`] trait and the [`Network`] bundle built around it at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConnectorError;
use crate::types::Asset;

pub mod pager;
pub mod timestamps;

pub use pager::{incoming_transfers_from, PageCursor, TransferPage};
pub use timestamps::BlockTimestamps;

/// One transfer into the bridge account
///
/// A single transaction may contain several transfers; `subindex` tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingTransfer {
    pub transaction_hash: String,
    pub subindex: u32,
    pub height: u64,
    pub sender: String,
    pub asset: Asset,
    pub amount: u64,
    /// Raw message attached by the depositor, expected to hold the destination address
    pub message: Vec<u8>,
}

/// Outgoing payout built by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub recipient: String,
    pub asset: Asset,
    pub amount: u64,
    /// Deposit transaction hash echoed into the payout for traceability
    pub memo: Option<String>,
}

/// A payout transaction the node reports as finalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTransaction {
    pub transaction_hash: String,
    pub height: u64,
}

/// Bounded polling for a just-announced transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub retry_count: u32,
    pub interval: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            retry_count: 12,
            interval: Duration::from_secs(5),
        }
    }
}

/// Operations the engine consumes from a blockchain node
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Highest height considered irreversible by the chain's consensus
    async fn current_finalized_height(&self) -> Result<u64, ConnectorError>;

    /// Timestamp of the block at `height`
    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ConnectorError>;

    /// Height of the most recent block produced at or before `timestamp` (0 if none)
    async fn block_height(&self, timestamp: DateTime<Utc>) -> Result<u64, ConnectorError>;

    /// Net change of `address`'s balance of `asset` caused by the block at `height`
    async fn balance_change(
        &self,
        address: &str,
        asset: &Asset,
        height: u64,
    ) -> Result<i64, ConnectorError>;

    /// One page of transfers into `address` within `[start_height, end_height)`
    async fn incoming_transfers_page(
        &self,
        address: &str,
        start_height: u64,
        end_height: u64,
        cursor: Option<&PageCursor>,
    ) -> Result<TransferPage, ConnectorError>;

    /// Fee the node expects for `transfer`, in the chain's fee currency
    async fn estimate_transfer_fee(&self, transfer: &Transfer) -> Result<u64, ConnectorError>;

    /// Sign `transfer` with the bridge's operational key and announce it; returns its hash
    async fn sign_and_announce(&self, transfer: &Transfer) -> Result<String, ConnectorError>;

    /// Poll until `transaction_hash` is in the unconfirmed pool; false once the retries run out
    async fn wait_for_unconfirmed(
        &self,
        transaction_hash: &str,
        timeout: &TimeoutSettings,
    ) -> Result<bool, ConnectorError>;

    /// Subset of `transaction_hashes` that is finalized, with the inclusion height
    async fn filter_finalized_transactions(
        &self,
        transaction_hashes: &[String],
    ) -> Result<Vec<FinalizedTransaction>, ConnectorError>;

    /// Whether `address` is well formed for this chain
    fn is_valid_address(&self, address: &str) -> bool;
}

/// A configured chain: its connector plus the bridge's presence on it
#[derive(Clone)]
pub struct Network {
    pub name: String,
    pub connector: Arc<dyn ChainConnector>,
    pub bridge_address: String,
    /// Asset the bridge accepts and pays out on this chain
    pub asset: Asset,
    /// Price ticker of `asset`, used for fee conversion
    pub asset_ticker: Option<String>,
    /// Price ticker of the currency transaction fees are paid in
    pub fee_ticker: Option<String>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("bridge_address", &self.bridge_address)
            .field("asset", &self.asset)
            .field("asset_ticker", &self.asset_ticker)
            .field("fee_ticker", &self.fee_ticker)
            .finish()
    }
}
