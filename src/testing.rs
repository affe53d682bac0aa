//! In-memory chain connector for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chain::{
    ChainConnector, FinalizedTransaction, IncomingTransfer, Network, PageCursor, TimeoutSettings,
    Transfer, TransferPage,
};
use crate::error::ConnectorError;
use crate::types::Asset;

/// Genesis used by [`MockConnector::with_block_time`]
pub fn genesis() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Default)]
pub struct MockState {
    pub finalized_height: u64,
    pub timestamps: HashMap<u64, DateTime<Utc>>,
    pub balance_changes: HashMap<u64, i64>,
    pub transfers: Vec<IncomingTransfer>,
    pub page_size: usize,
    /// Remaining transient failures per height (u32::MAX fails forever)
    pub failing_heights: HashMap<u64, u32>,
    pub download_calls: HashMap<u64, u32>,
    pub transfer_fee: u64,
    pub announce_error: Option<(bool, String)>,
    pub announced: Vec<Transfer>,
    pub reaches_unconfirmed: bool,
    /// Node error returned by the unconfirmed wait
    pub unconfirmed_error: Option<String>,
    pub unconfirmed_delay: Option<Duration>,
    pub finalized: HashMap<String, u64>,
    pub finalized_queries: u32,
    pub address_prefix: String,
}

/// Scriptable [`ChainConnector`]
#[derive(Clone)]
pub struct MockConnector {
    pub state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(address_prefix: &str) -> Self {
        let state = MockState {
            page_size: 2,
            reaches_unconfirmed: true,
            address_prefix: address_prefix.to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Blocks `0..=max_height` produced every `seconds` seconds from [`genesis`]
    pub fn with_block_time(self, max_height: u64, seconds: i64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for height in 0..=max_height {
                state
                    .timestamps
                    .insert(height, genesis() + ChronoDuration::seconds(seconds * height as i64));
            }
            state.finalized_height = max_height;
        }
        self
    }

    pub fn set_finalized_height(&self, height: u64) {
        self.state.lock().unwrap().finalized_height = height;
    }

    pub fn set_balance_change(&self, height: u64, amount: i64) {
        self.state.lock().unwrap().balance_changes.insert(height, amount);
    }

    pub fn add_transfer(&self, transfer: IncomingTransfer) {
        self.state.lock().unwrap().transfers.push(transfer);
    }

    pub fn fail_height(&self, height: u64, times: u32) {
        self.state.lock().unwrap().failing_heights.insert(height, times);
    }

    pub fn download_calls(&self, height: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .download_calls
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_transfer_fee(&self, fee: u64) {
        self.state.lock().unwrap().transfer_fee = fee;
    }

    pub fn fail_announce(&self, transient: bool, message: &str) {
        self.state.lock().unwrap().announce_error = Some((transient, message.to_string()));
    }

    pub fn set_reaches_unconfirmed(&self, reaches: bool) {
        self.state.lock().unwrap().reaches_unconfirmed = reaches;
    }

    pub fn fail_unconfirmed_wait(&self, message: &str) {
        self.state.lock().unwrap().unconfirmed_error = Some(message.to_string());
    }

    pub fn delay_unconfirmed_wait(&self, delay: Duration) {
        self.state.lock().unwrap().unconfirmed_delay = Some(delay);
    }

    pub fn finalize(&self, transaction_hash: &str, height: u64) {
        self.state
            .lock()
            .unwrap()
            .finalized
            .insert(transaction_hash.to_string(), height);
    }

    pub fn announced(&self) -> Vec<Transfer> {
        self.state.lock().unwrap().announced.clone()
    }

    pub fn network(&self, name: &str, bridge_address: &str, asset: Asset) -> Network {
        Network {
            name: name.to_string(),
            connector: Arc::new(self.clone()),
            bridge_address: bridge_address.to_string(),
            asset,
            asset_ticker: None,
            fee_ticker: None,
        }
    }

    fn record_download(&self, height: u64) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().unwrap();
        *state.download_calls.entry(height).or_insert(0) += 1;
        if let Some(remaining) = state.failing_heights.get_mut(&height) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(ConnectorError::Unavailable(format!(
                    "connection reset while reading height {}",
                    height
                )));
            }
        }
        Ok(())
    }
}

/// Incoming transfer with a UTF-8 destination message
pub fn incoming(hash: &str, subindex: u32, height: u64, amount: u64, destination: &str) -> IncomingTransfer {
    IncomingTransfer {
        transaction_hash: hash.to_string(),
        subindex,
        height,
        sender: "SENDER".to_string(),
        asset: Asset::Native,
        amount,
        message: destination.as_bytes().to_vec(),
    }
}

#[async_trait]
impl ChainConnector for MockConnector {
    async fn current_finalized_height(&self) -> Result<u64, ConnectorError> {
        Ok(self.state.lock().unwrap().finalized_height)
    }

    async fn block_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ConnectorError> {
        self.state
            .lock()
            .unwrap()
            .timestamps
            .get(&height)
            .copied()
            .ok_or_else(|| ConnectorError::Unavailable(format!("block {} not found", height)))
    }

    async fn block_height(&self, timestamp: DateTime<Utc>) -> Result<u64, ConnectorError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .timestamps
            .iter()
            .filter(|(_, t)| **t <= timestamp)
            .map(|(h, _)| *h)
            .max()
            .unwrap_or(0))
    }

    async fn balance_change(
        &self,
        _address: &str,
        _asset: &Asset,
        height: u64,
    ) -> Result<i64, ConnectorError> {
        self.record_download(height)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .balance_changes
            .get(&height)
            .copied()
            .unwrap_or(0))
    }

    async fn incoming_transfers_page(
        &self,
        _address: &str,
        start_height: u64,
        end_height: u64,
        cursor: Option<&PageCursor>,
    ) -> Result<TransferPage, ConnectorError> {
        if cursor.is_none() {
            for height in start_height..end_height {
                self.record_download(height)?;
            }
        }

        let state = self.state.lock().unwrap();
        let matching: Vec<IncomingTransfer> = state
            .transfers
            .iter()
            .filter(|t| t.height >= start_height && t.height < end_height)
            .cloned()
            .collect();
        let offset = match cursor {
            Some(PageCursor(c)) => c
                .parse::<usize>()
                .map_err(|_| ConnectorError::Malformed(format!("bad cursor {}", c)))?,
            None => 0,
        };
        let page_end = (offset + state.page_size).min(matching.len());
        let next = (page_end < matching.len()).then(|| PageCursor(page_end.to_string()));

        Ok(TransferPage {
            transfers: matching.get(offset..page_end).map(<[_]>::to_vec).unwrap_or_default(),
            next,
        })
    }

    async fn estimate_transfer_fee(&self, _transfer: &Transfer) -> Result<u64, ConnectorError> {
        Ok(self.state.lock().unwrap().transfer_fee)
    }

    async fn sign_and_announce(&self, transfer: &Transfer) -> Result<String, ConnectorError> {
        let mut state = self.state.lock().unwrap();
        if let Some((transient, message)) = &state.announce_error {
            return Err(if *transient {
                ConnectorError::Unavailable(message.clone())
            } else {
                ConnectorError::Rejected(message.clone())
            });
        }
        state.announced.push(transfer.clone());
        Ok(format!("payout-{}", state.announced.len()))
    }

    async fn wait_for_unconfirmed(
        &self,
        _transaction_hash: &str,
        _timeout: &TimeoutSettings,
    ) -> Result<bool, ConnectorError> {
        let delay = self.state.lock().unwrap().unconfirmed_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        match &state.unconfirmed_error {
            Some(message) => Err(ConnectorError::Unavailable(message.clone())),
            None => Ok(state.reaches_unconfirmed),
        }
    }

    async fn filter_finalized_transactions(
        &self,
        transaction_hashes: &[String],
    ) -> Result<Vec<FinalizedTransaction>, ConnectorError> {
        let mut state = self.state.lock().unwrap();
        state.finalized_queries += 1;
        Ok(transaction_hashes
            .iter()
            .filter_map(|hash| {
                state.finalized.get(hash).map(|height| FinalizedTransaction {
                    transaction_hash: hash.clone(),
                    height: *height,
                })
            })
            .collect())
    }

    fn is_valid_address(&self, address: &str) -> bool {
        let prefix = &self.state.lock().unwrap().address_prefix;
        address.starts_with(prefix.as_str()) && address.len() > prefix.len()
    }
}
