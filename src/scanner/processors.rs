use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::{pin_mut, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::HeightProcessor;
use crate::chain::{incoming_transfers_from, BlockTimestamps, ChainConnector, IncomingTransfer, Network};
use crate::db::{BalanceChangeLedger, NewTransferRequest, RequestLedger};
use crate::metrics::Metrics;

/// Downloads the bridge account's balance delta of every native height
pub struct BalanceChangeProcessor {
    network: Network,
    ledger: BalanceChangeLedger,
}

impl BalanceChangeProcessor {
    pub fn new(network: Network, ledger: BalanceChangeLedger) -> Self {
        Self { network, ledger }
    }
}

#[async_trait]
impl HeightProcessor for BalanceChangeProcessor {
    fn ledger_name(&self) -> &str {
        self.ledger.ledger_name()
    }

    async fn max_processed_height(&self) -> Result<Option<u64>> {
        self.ledger.max_processed_height().await
    }

    async fn set_max_processed_height(&self, height: u64) -> Result<()> {
        self.ledger.set_max_processed_height(height).await
    }

    async fn process_height(&self, height: u64) -> Result<()> {
        let change = self
            .network
            .connector
            .balance_change(&self.network.bridge_address, &self.network.asset, height)
            .await?;

        if change != 0 {
            debug!(network = %self.network.name, height, change, "Bridge balance changed");
            self.ledger.add_balance_change(height, change).await?;
        }
        Ok(())
    }
}

/// Turns deposits into the bridge account into transfer requests
///
/// Deposits that cannot be paid out are recorded as request errors instead, so every
/// deposit ends up in exactly one of the two tables.
pub struct TransferRequestProcessor {
    deposit_network: Network,
    payout_connector: Arc<dyn ChainConnector>,
    ledger: RequestLedger,
    timestamps: BlockTimestamps,
    metrics: Metrics,
}

impl TransferRequestProcessor {
    pub fn new(
        deposit_network: Network,
        payout_connector: Arc<dyn ChainConnector>,
        ledger: RequestLedger,
        timestamps: BlockTimestamps,
        metrics: Metrics,
    ) -> Self {
        Self {
            deposit_network,
            payout_connector,
            ledger,
            timestamps,
            metrics,
        }
    }

    /// Validate a deposit; the error string is stored as the request error message
    fn parse_request(&self, transfer: &IncomingTransfer) -> std::result::Result<NewTransferRequest, String> {
        if transfer.asset != self.deposit_network.asset {
            return Err(format!("unsupported asset {}", transfer.asset));
        }
        if transfer.amount == 0 {
            return Err("deposit amount is zero".to_string());
        }

        let destination = std::str::from_utf8(&transfer.message).map_err(|_| {
            format!(
                "message is not valid UTF-8: 0x{}",
                hex::encode(&transfer.message)
            )
        })?;
        let destination = destination.trim();
        if destination.is_empty() {
            return Err("message does not contain a destination address".to_string());
        }
        if !self.payout_connector.is_valid_address(destination) {
            return Err(format!("invalid destination address {}", destination));
        }

        Ok(NewTransferRequest {
            source_address: transfer.sender.clone(),
            amount: transfer.amount,
            destination_address: destination.to_string(),
            deposit_transaction_hash: transfer.transaction_hash.clone(),
            deposit_transaction_height: transfer.height,
            deposit_transaction_subindex: transfer.subindex,
        })
    }

    async fn ingest(&self, transfer: &IncomingTransfer) -> Result<()> {
        let kind = self.ledger.kind();
        match self.parse_request(transfer) {
            Ok(request) => {
                if self.ledger.add_request(&request).await? {
                    self.metrics
                        .requests_ingested
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    info!(
                        kind = %kind,
                        deposit_hash = %request.deposit_transaction_hash,
                        subindex = request.deposit_transaction_subindex,
                        height = request.deposit_transaction_height,
                        amount = request.amount,
                        destination = %request.destination_address,
                        "New transfer request detected"
                    );
                }
            }
            Err(message) => {
                if self
                    .ledger
                    .add_error(transfer.height, &transfer.transaction_hash, transfer.subindex, &message)
                    .await?
                {
                    self.metrics
                        .request_errors
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    warn!(
                        kind = %kind,
                        deposit_hash = %transfer.transaction_hash,
                        subindex = transfer.subindex,
                        height = transfer.height,
                        error = %message,
                        "Deposit rejected"
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HeightProcessor for TransferRequestProcessor {
    fn ledger_name(&self) -> &str {
        self.ledger.kind().ledger_name()
    }

    async fn max_processed_height(&self) -> Result<Option<u64>> {
        self.ledger.max_processed_height().await
    }

    async fn set_max_processed_height(&self, height: u64) -> Result<()> {
        self.ledger.set_max_processed_height(height).await
    }

    async fn process_height(&self, height: u64) -> Result<()> {
        let transfers = incoming_transfers_from(
            Arc::clone(&self.deposit_network.connector),
            self.deposit_network.bridge_address.clone(),
            height,
            height + 1,
            None,
        );
        pin_mut!(transfers);

        let mut seen = 0usize;
        while let Some((_cursor, transfer)) = transfers.try_next().await? {
            self.ingest(&transfer)
                .await
                .wrap_err_with(|| format!("Failed to ingest deposit {}", transfer.transaction_hash))?;
            seen += 1;
        }

        // redemption sums join deposits with their block time
        if seen > 0 {
            self.timestamps.timestamp(height).await?;
            debug!(
                network = %self.deposit_network.name,
                height,
                transfers = seen,
                "Processed incoming transfers"
            );
        }
        Ok(())
    }
}
