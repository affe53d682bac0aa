use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::{RequestKind, RequestStatus};

// SQLite stores integers as i64. Rows use i64 and convert at the edge; heights and
// amounts never exceed i64::MAX on the supported chains.

/// Raw `transfer_requests` row
#[derive(Debug, Clone, FromRow)]
pub struct TransferRequestRow {
    pub kind: String,
    pub deposit_transaction_hash: String,
    pub deposit_transaction_subindex: i64,
    pub deposit_transaction_height: i64,
    pub source_address: String,
    pub destination_address: String,
    pub amount: i64,
    pub status: String,
    pub payout_transaction_hash: Option<String>,
    pub payout_net_amount: Option<i64>,
    pub payout_total_fee: Option<i64>,
    pub payout_conversion_rate: Option<String>,
    pub payout_transaction_height: Option<i64>,
    pub payout_transaction_timestamp_ms: Option<i64>,
    pub failure_reason: Option<String>,
}

/// A detected deposit and its payout outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub kind: RequestKind,
    pub source_address: String,
    pub amount: u64,
    pub destination_address: String,
    pub deposit_transaction_hash: String,
    pub deposit_transaction_height: u64,
    pub deposit_transaction_subindex: u32,
    pub status: RequestStatus,
    pub payout_transaction_hash: Option<String>,
    pub payout_net_amount: Option<u64>,
    pub payout_total_fee: Option<u64>,
    pub payout_conversion_rate: Option<BigDecimal>,
    pub payout_transaction_height: Option<u64>,
    pub payout_transaction_timestamp: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl TryFrom<TransferRequestRow> for TransferRequest {
    type Error = eyre::Report;

    fn try_from(row: TransferRequestRow) -> Result<Self> {
        let kind = match row.kind.as_str() {
            "wrap" => RequestKind::Wrap,
            "unwrap" => RequestKind::Unwrap,
            other => return Err(eyre!("unknown request kind '{}'", other)),
        };
        let payout_conversion_rate = row
            .payout_conversion_rate
            .as_deref()
            .map(BigDecimal::from_str)
            .transpose()
            .wrap_err("Invalid stored conversion rate")?;
        let payout_transaction_timestamp = row
            .payout_transaction_timestamp_ms
            .map(|ms| {
                DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| eyre!("invalid stored payout timestamp {}", ms))
            })
            .transpose()?;

        Ok(Self {
            kind,
            source_address: row.source_address,
            amount: to_u64(row.amount, "amount")?,
            destination_address: row.destination_address,
            deposit_transaction_hash: row.deposit_transaction_hash,
            deposit_transaction_height: to_u64(
                row.deposit_transaction_height,
                "deposit_transaction_height",
            )?,
            deposit_transaction_subindex: u32::try_from(row.deposit_transaction_subindex)
                .wrap_err("Invalid stored deposit_transaction_subindex")?,
            status: row.status.parse()?,
            payout_transaction_hash: row.payout_transaction_hash,
            payout_net_amount: row
                .payout_net_amount
                .map(|v| to_u64(v, "payout_net_amount"))
                .transpose()?,
            payout_total_fee: row
                .payout_total_fee
                .map(|v| to_u64(v, "payout_total_fee"))
                .transpose()?,
            payout_conversion_rate,
            payout_transaction_height: row
                .payout_transaction_height
                .map(|v| to_u64(v, "payout_transaction_height"))
                .transpose()?,
            payout_transaction_timestamp,
            failure_reason: row.failure_reason,
        })
    }
}

/// For inserting newly detected deposits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransferRequest {
    pub source_address: String,
    pub amount: u64,
    pub destination_address: String,
    pub deposit_transaction_hash: String,
    pub deposit_transaction_height: u64,
    pub deposit_transaction_subindex: u32,
}

/// A deposit that failed validation and will never be paid out
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RequestError {
    pub height: i64,
    pub transaction_hash: String,
    pub transaction_subindex: i64,
    pub message: String,
}

/// Recorded on a request once its payout transaction is announced
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutDetails {
    pub transaction_hash: String,
    pub net_amount: u64,
    pub total_fee: u64,
    pub conversion_rate: BigDecimal,
}

pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("negative value {} stored in {}", value, column))
}

pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("value {} for {} does not fit in i64", value, column))
}
