use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::RateLimiter;
use std::sync::Arc;

use crate::chain::{
    ChainConnector, FinalizedTransaction, PageCursor, TimeoutSettings, Transfer, TransferPage,
};
use crate::error::ConnectorError;
use crate::types::Asset;

pub(crate) type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Connector that waits for a rate limiter token before every node call
pub struct ThrottledConnector {
    inner: Arc<dyn ChainConnector>,
    limiter: Arc<DirectRateLimiter>,
}

impl ThrottledConnector {
    pub(crate) fn new(inner: Arc<dyn ChainConnector>, limiter: Arc<DirectRateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl ChainConnector for ThrottledConnector {
    async fn current_finalized_height(&self) -> Result<u64, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.current_finalized_height().await
    }

    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.block_timestamp(height).await
    }

    async fn block_height(&self, timestamp: DateTime<Utc>) -> Result<u64, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.block_height(timestamp).await
    }

    async fn balance_change(
        &self,
        address: &str,
        asset: &Asset,
        height: u64,
    ) -> Result<i64, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.balance_change(address, asset, height).await
    }

    async fn incoming_transfers_page(
        &self,
        address: &str,
        start_height: u64,
        end_height: u64,
        cursor: Option<&PageCursor>,
    ) -> Result<TransferPage, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner
            .incoming_transfers_page(address, start_height, end_height, cursor)
            .await
    }

    async fn estimate_transfer_fee(&self, transfer: &Transfer) -> Result<u64, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.estimate_transfer_fee(transfer).await
    }

    async fn sign_and_announce(&self, transfer: &Transfer) -> Result<String, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.sign_and_announce(transfer).await
    }

    async fn wait_for_unconfirmed(
        &self,
        transaction_hash: &str,
        timeout: &TimeoutSettings,
    ) -> Result<bool, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.wait_for_unconfirmed(transaction_hash, timeout).await
    }

    async fn filter_finalized_transactions(
        &self,
        transaction_hashes: &[String],
    ) -> Result<Vec<FinalizedTransaction>, ConnectorError> {
        self.limiter.until_ready().await;
        self.inner.filter_finalized_transactions(transaction_hashes).await
    }

    // local check, no node call
    fn is_valid_address(&self, address: &str) -> bool {
        self.inner.is_valid_address(address)
    }
}
