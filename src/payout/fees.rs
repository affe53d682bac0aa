//! Payout amount and fee computation

use bigdecimal::{BigDecimal, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::conversion::ConversionFunction;
use crate::db::TransferRequest;
use crate::error::PayoutError;

/// Business limits applied to every payout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSettings {
    /// Share of the gross amount kept by the bridge, e.g. `0.003` for 0.3%
    pub percentage_conversion_fee: BigDecimal,
    /// Largest gross amount paid out in a single transfer
    pub max_transfer_amount: u64,
}

/// A request that passed the amount checks and is ready to be priced
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSend {
    pub destination_address: String,
    pub memo: String,
    pub gross_amount: u64,
    pub fee_multiplier: BigDecimal,
    pub conversion_rate: BigDecimal,
}

impl PreparedSend {
    /// Total fee for a transaction that costs `transaction_fee` on the payout chain
    pub fn total_fee(&self, settings: &FeeSettings, transaction_fee: u64) -> u64 {
        total_fee(
            &self.fee_multiplier,
            transaction_fee,
            &settings.percentage_conversion_fee,
            self.gross_amount,
        )
    }

    /// Net amount after fees; rejects payouts that fees would consume entirely
    pub fn net_amount(&self, settings: &FeeSettings, transaction_fee: u64) -> Result<(u64, u64), PayoutError> {
        let fee = self.total_fee(settings, transaction_fee);
        if fee >= self.gross_amount {
            return Err(PayoutError::FeeExceedsAmount {
                amount: self.gross_amount,
                fee,
            });
        }
        Ok((self.gross_amount - fee, fee))
    }
}

/// Convert the deposit and check it against the transfer limit
pub fn prepare_send(
    request: &TransferRequest,
    conversion: &ConversionFunction,
    fee_multiplier: &BigDecimal,
    settings: &FeeSettings,
) -> Result<PreparedSend, PayoutError> {
    let gross_amount = conversion.convert(request.amount);
    if gross_amount > settings.max_transfer_amount {
        return Err(PayoutError::ExceedsMaximum {
            amount: gross_amount,
            maximum: settings.max_transfer_amount,
        });
    }

    Ok(PreparedSend {
        destination_address: request.destination_address.clone(),
        memo: request.deposit_transaction_hash.clone(),
        gross_amount,
        fee_multiplier: fee_multiplier.clone(),
        conversion_rate: conversion.calculator().rate(),
    })
}

/// `ceil(fee_multiplier × (transaction_fee + percentage × gross))`, saturating at u64::MAX
pub fn total_fee(
    fee_multiplier: &BigDecimal,
    transaction_fee: u64,
    percentage: &BigDecimal,
    gross_amount: u64,
) -> u64 {
    let fee = fee_multiplier
        * (BigDecimal::from(transaction_fee) + percentage * BigDecimal::from(gross_amount));
    ceil_to_u64(&fee)
}

fn ceil_to_u64(value: &BigDecimal) -> u64 {
    let truncated = value.with_scale(0);
    let ceiled = if &truncated < value {
        truncated + BigDecimal::from(1)
    } else {
        truncated
    };
    if ceiled < BigDecimal::from(0) {
        return 0;
    }
    ceiled.to_u64().unwrap_or(u64::MAX)
}
