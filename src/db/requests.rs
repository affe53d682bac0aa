//! Persistent store of transfer requests for one bridge direction

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, warn};

use super::models::{
    to_i64, to_u64, NewTransferRequest, PayoutDetails, RequestError, TransferRequest,
    TransferRequestRow,
};
use crate::types::{RequestKind, RequestStatus};

/// SQL SELECT columns for the transfer_requests table
const REQUEST_SELECT: &str = r#"kind, deposit_transaction_hash, deposit_transaction_subindex,
    deposit_transaction_height, source_address, destination_address, amount, status,
    payout_transaction_hash, payout_net_amount, payout_total_fee, payout_conversion_rate,
    payout_transaction_height, payout_transaction_timestamp_ms, failure_reason"#;

/// Requests and request errors of one [`RequestKind`]
///
/// Every status transition is a single UPDATE keyed by the request identity and
/// guarded by the status it is allowed to leave, so a request that has left
/// UNPROCESSED can never be selected for payout again.
#[derive(Debug, Clone)]
pub struct RequestLedger {
    pool: SqlitePool,
    kind: RequestKind,
}

impl RequestLedger {
    pub fn new(pool: SqlitePool, kind: RequestKind) -> Self {
        Self { pool, kind }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Insert a newly detected deposit
    ///
    /// Returns false when the same `(hash, subindex)` was ingested before.
    pub async fn add_request(&self, request: &NewTransferRequest) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_requests (kind, deposit_transaction_hash, deposit_transaction_subindex,
                deposit_transaction_height, source_address, destination_address, amount)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (kind, deposit_transaction_hash, deposit_transaction_subindex) DO NOTHING
            "#,
        )
        .bind(self.kind.as_str())
        .bind(&request.deposit_transaction_hash)
        .bind(i64::from(request.deposit_transaction_subindex))
        .bind(to_i64(request.deposit_transaction_height, "deposit_transaction_height")?)
        .bind(&request.source_address)
        .bind(&request.destination_address)
        .bind(to_i64(request.amount, "amount")?)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to insert {} request {}:{}",
                self.kind, request.deposit_transaction_hash, request.deposit_transaction_subindex
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a deposit that could not be parsed into a request
    pub async fn add_error(
        &self,
        height: u64,
        transaction_hash: &str,
        transaction_subindex: u32,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO request_errors (kind, height, transaction_hash, transaction_subindex, message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (kind, transaction_hash, transaction_subindex) DO NOTHING
            "#,
        )
        .bind(self.kind.as_str())
        .bind(to_i64(height, "height")?)
        .bind(transaction_hash)
        .bind(i64::from(transaction_subindex))
        .bind(message)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to insert {} request error {}", self.kind, transaction_hash))?;

        Ok(result.rows_affected() == 1)
    }

    /// All recorded request errors, oldest first
    pub async fn request_errors(&self) -> Result<Vec<RequestError>> {
        let rows = sqlx::query_as::<_, RequestError>(
            r#"
            SELECT height, transaction_hash, transaction_subindex, message FROM request_errors
            WHERE kind = ?1 ORDER BY height, transaction_hash, transaction_subindex
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_all(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to get {} request errors", self.kind))?;

        Ok(rows)
    }

    /// Requests with `status`, in deposit order
    pub async fn requests_by_status(&self, status: RequestStatus) -> Result<Vec<TransferRequest>> {
        let query = format!(
            "SELECT {} FROM transfer_requests WHERE kind = ?1 AND status = ?2 \
             ORDER BY deposit_transaction_height, deposit_transaction_hash, deposit_transaction_subindex",
            REQUEST_SELECT
        );
        let rows = sqlx::query_as::<_, TransferRequestRow>(&query)
            .bind(self.kind.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get {} {} requests", status, self.kind))?;

        rows.into_iter().map(TransferRequest::try_from).collect()
    }

    /// Look up a single request by its identity
    pub async fn find_request(
        &self,
        deposit_transaction_hash: &str,
        deposit_transaction_subindex: u32,
    ) -> Result<Option<TransferRequest>> {
        let query = format!(
            "SELECT {} FROM transfer_requests WHERE kind = ?1 AND deposit_transaction_hash = ?2 \
             AND deposit_transaction_subindex = ?3",
            REQUEST_SELECT
        );
        let row = sqlx::query_as::<_, TransferRequestRow>(&query)
            .bind(self.kind.as_str())
            .bind(deposit_transaction_hash)
            .bind(i64::from(deposit_transaction_subindex))
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get {} request {}", self.kind, deposit_transaction_hash))?;

        row.map(TransferRequest::try_from).transpose()
    }

    /// UNPROCESSED -> SENT with the payout details
    ///
    /// Returns false if the request already left UNPROCESSED.
    pub async fn mark_payout_sent(
        &self,
        request: &TransferRequest,
        details: &PayoutDetails,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_requests SET status = 'sent', payout_transaction_hash = ?1,
                payout_net_amount = ?2, payout_total_fee = ?3, payout_conversion_rate = ?4,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE kind = ?5 AND deposit_transaction_hash = ?6 AND deposit_transaction_subindex = ?7
                AND status = 'unprocessed'
            "#,
        )
        .bind(&details.transaction_hash)
        .bind(to_i64(details.net_amount, "payout_net_amount")?)
        .bind(to_i64(details.total_fee, "payout_total_fee")?)
        .bind(details.conversion_rate.to_string())
        .bind(self.kind.as_str())
        .bind(&request.deposit_transaction_hash)
        .bind(i64::from(request.deposit_transaction_subindex))
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to mark {} request {} as sent",
                self.kind, request.deposit_transaction_hash
            )
        })?;

        let updated = result.rows_affected() == 1;
        if !updated {
            warn!(
                kind = %self.kind,
                deposit_hash = %request.deposit_transaction_hash,
                subindex = request.deposit_transaction_subindex,
                payout_hash = %details.transaction_hash,
                "Request was no longer unprocessed when recording payout"
            );
        }
        Ok(updated)
    }

    /// UNPROCESSED or SENT -> FAILED with a reason
    pub async fn mark_payout_failed(&self, request: &TransferRequest, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_requests SET status = 'failed', failure_reason = ?1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE kind = ?2 AND deposit_transaction_hash = ?3 AND deposit_transaction_subindex = ?4
                AND status IN ('unprocessed', 'sent')
            "#,
        )
        .bind(reason)
        .bind(self.kind.as_str())
        .bind(&request.deposit_transaction_hash)
        .bind(i64::from(request.deposit_transaction_subindex))
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to mark {} request {} as failed",
                self.kind, request.deposit_transaction_hash
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// UNPROCESSED -> FAILED for a request whose payout was announced but not seen
    ///
    /// The payout details are kept so the announced amount stays in the issuance
    /// index and the transaction can be looked up by hand.
    pub async fn mark_announced_payout_failed(
        &self,
        request: &TransferRequest,
        details: &PayoutDetails,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_requests SET status = 'failed', payout_transaction_hash = ?1,
                payout_net_amount = ?2, payout_total_fee = ?3, payout_conversion_rate = ?4,
                failure_reason = ?5, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE kind = ?6 AND deposit_transaction_hash = ?7 AND deposit_transaction_subindex = ?8
                AND status = 'unprocessed'
            "#,
        )
        .bind(&details.transaction_hash)
        .bind(to_i64(details.net_amount, "payout_net_amount")?)
        .bind(to_i64(details.total_fee, "payout_total_fee")?)
        .bind(details.conversion_rate.to_string())
        .bind(reason)
        .bind(self.kind.as_str())
        .bind(&request.deposit_transaction_hash)
        .bind(i64::from(request.deposit_transaction_subindex))
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to mark announced {} payout {} as failed",
                self.kind, details.transaction_hash
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// SENT -> COMPLETED for the request paid out by `transaction_hash`
    ///
    /// Height and timestamp are written together with the status, so running this
    /// twice for the same transaction records them only once.
    pub async fn mark_payout_completed(
        &self,
        transaction_hash: &str,
        height: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_requests SET status = 'completed', payout_transaction_height = ?1,
                payout_transaction_timestamp_ms = ?2,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE kind = ?3 AND payout_transaction_hash = ?4 AND status = 'sent'
            "#,
        )
        .bind(to_i64(height, "payout_transaction_height")?)
        .bind(timestamp.timestamp_millis())
        .bind(self.kind.as_str())
        .bind(transaction_hash)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to mark {} payout {} as completed", self.kind, transaction_hash))?;

        if result.rows_affected() > 1 {
            warn!(
                kind = %self.kind,
                payout_hash = %transaction_hash,
                rows = result.rows_affected(),
                "Payout transaction hash shared by several requests"
            );
        }
        Ok(result.rows_affected() > 0)
    }

    /// Payout hashes of SENT requests that are not finalized yet
    pub async fn unconfirmed_payout_transaction_hashes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT payout_transaction_hash FROM transfer_requests
            WHERE kind = ?1 AND status = 'sent' AND payout_transaction_hash IS NOT NULL
            ORDER BY payout_transaction_hash
            "#,
        )
        .bind(self.kind.as_str())
        .fetch_all(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to get unconfirmed {} payouts", self.kind))?;

        Ok(rows.iter().map(|r| r.get("payout_transaction_hash")).collect())
    }

    /// Gross amount (net + fee) announced for deposits at or below `height`
    ///
    /// For wrap requests this is the wrapped token issuance index. Every request that
    /// carries a payout transaction counts, whatever its status, so a later expiry
    /// does not change the rate of heights already priced.
    pub async fn cumulative_gross_payout_at(&self, height: u64) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(payout_net_amount + payout_total_fee), 0) AS total FROM transfer_requests
            WHERE kind = ?1 AND payout_transaction_hash IS NOT NULL
                AND deposit_transaction_height <= ?2
            "#,
        )
        .bind(self.kind.as_str())
        .bind(to_i64(height, "height")?)
        .fetch_one(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to sum {} payouts at {}", self.kind, height))?;

        to_u64(row.get("total"), "cumulative gross payout")
    }

    /// Deposited amount of all requests whose deposit block is at or before `timestamp`
    ///
    /// For unwrap requests this is the redemption index. Only heights with a cached
    /// block timestamp can be counted; the scanner caches every height that carried
    /// a deposit.
    pub async fn cumulative_amount_at(&self, network: &str, timestamp: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(r.amount), 0) AS total FROM transfer_requests r
            JOIN block_timestamps b ON b.network = ?1 AND b.height = r.deposit_transaction_height
            WHERE r.kind = ?2 AND b.timestamp_ms <= ?3
            "#,
        )
        .bind(network)
        .bind(self.kind.as_str())
        .bind(timestamp.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to sum {} deposits at {}", self.kind, timestamp))?;

        to_u64(row.get("total"), "cumulative amount")
    }

    pub async fn max_processed_height(&self) -> Result<Option<u64>> {
        super::get_max_processed_height(&self.pool, self.kind.ledger_name()).await
    }

    pub async fn set_max_processed_height(&self, height: u64) -> Result<()> {
        debug!(ledger = self.kind.ledger_name(), height, "Advancing watermark");
        super::set_max_processed_height(&self.pool, self.kind.ledger_name(), height).await
    }
}
