//! Completion and expiry of outstanding requests

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{BlockTimestamps, ChainConnector};
use crate::db::RequestLedger;
use crate::metrics::Metrics;
use crate::types::RequestStatus;

/// Result of one reconciliation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub completed: usize,
    pub expired: usize,
}

/// Moves SENT requests to COMPLETED once their payout is final, and fails requests
/// that outlived their lifetime
pub struct FinalizationReconciler {
    ledger: RequestLedger,
    payout_connector: Arc<dyn ChainConnector>,
    payout_timestamps: BlockTimestamps,
    deposit_timestamps: BlockTimestamps,
    request_lifetime: ChronoDuration,
    metrics: Metrics,
}

impl FinalizationReconciler {
    pub fn new(
        ledger: RequestLedger,
        payout_connector: Arc<dyn ChainConnector>,
        payout_timestamps: BlockTimestamps,
        deposit_timestamps: BlockTimestamps,
        request_lifetime_hours: u32,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            payout_connector,
            payout_timestamps,
            deposit_timestamps,
            request_lifetime: ChronoDuration::hours(i64::from(request_lifetime_hours)),
            metrics,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        self.reconcile_at(Utc::now()).await
    }

    /// Reconcile as if the current time were `now`
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileSummary> {
        let completed = self.complete_finalized().await?;
        let expired = self.expire_stale(now).await?;
        Ok(ReconcileSummary { completed, expired })
    }

    async fn complete_finalized(&self) -> Result<usize> {
        let kind = self.ledger.kind();
        let hashes = self.ledger.unconfirmed_payout_transaction_hashes().await?;
        if hashes.is_empty() {
            return Ok(0);
        }

        let finalized = self
            .payout_connector
            .filter_finalized_transactions(&hashes)
            .await
            .wrap_err("Failed to query finalized payouts")?;
        debug!(kind = %kind, unconfirmed = hashes.len(), finalized = finalized.len(), "Checked payouts");

        let mut completed = 0;
        for transaction in finalized {
            let timestamp = self.payout_timestamps.timestamp(transaction.height).await?;
            if self
                .ledger
                .mark_payout_completed(&transaction.transaction_hash, transaction.height, timestamp)
                .await?
            {
                completed += 1;
                self.metrics.completions.with_label_values(&[kind.as_str()]).inc();
                info!(
                    kind = %kind,
                    payout_hash = %transaction.transaction_hash,
                    height = transaction.height,
                    %timestamp,
                    "Payout finalized"
                );
            }
        }
        Ok(completed)
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let kind = self.ledger.kind();
        let cutoff = now - self.request_lifetime;
        let mut expired = 0;

        for status in [RequestStatus::Unprocessed, RequestStatus::Sent] {
            for request in self.ledger.requests_by_status(status).await? {
                let deposited_at = self
                    .deposit_timestamps
                    .timestamp(request.deposit_transaction_height)
                    .await?;
                if deposited_at >= cutoff {
                    continue;
                }

                let reason = format!(
                    "expired: deposited at {} and still {} after {} hours",
                    deposited_at.to_rfc3339(),
                    status,
                    self.request_lifetime.num_hours()
                );
                if self.ledger.mark_payout_failed(&request, &reason).await? {
                    expired += 1;
                    self.metrics.expirations.with_label_values(&[kind.as_str()]).inc();
                    warn!(
                        kind = %kind,
                        deposit_hash = %request.deposit_transaction_hash,
                        subindex = request.deposit_transaction_subindex,
                        status = %status,
                        payout_hash = ?request.payout_transaction_hash,
                        "Request expired"
                    );
                }
            }
        }
        Ok(expired)
    }
}
