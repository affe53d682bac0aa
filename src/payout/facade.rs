//! Payout side of a bridge direction
//!
//! The capability set is closed and chosen once at startup from the bridge mode and
//! the direction being paid out.

use bigdecimal::BigDecimal;
use std::sync::Arc;
use tracing::debug;

use super::oracle::PriceOracle;
use crate::chain::{ChainConnector, Network, Transfer};
use crate::error::ConnectorError;
use crate::types::{BridgeMode, RequestKind};

#[derive(Debug, Clone)]
pub enum PayoutNetwork {
    /// Native deposits paid out as wrapped tokens
    NativeToWrapped(Network),
    /// Wrapped deposits paid out in the native currency
    WrappedToNative(Network),
    /// Native currency paid out as another chain's native currency
    NativeToNative(Network),
}

impl PayoutNetwork {
    /// Variant paying out requests of `kind` on `network`
    pub fn select(mode: BridgeMode, kind: RequestKind, network: Network) -> Self {
        match (mode, kind) {
            (BridgeMode::Swap, _) => PayoutNetwork::NativeToNative(network),
            (BridgeMode::Wrapped, RequestKind::Wrap) => PayoutNetwork::NativeToWrapped(network),
            (BridgeMode::Wrapped, RequestKind::Unwrap) => PayoutNetwork::WrappedToNative(network),
        }
    }

    pub fn network(&self) -> &Network {
        match self {
            PayoutNetwork::NativeToWrapped(network)
            | PayoutNetwork::WrappedToNative(network)
            | PayoutNetwork::NativeToNative(network) => network,
        }
    }

    pub fn connector(&self) -> &Arc<dyn ChainConnector> {
        &self.network().connector
    }

    pub fn label(&self) -> &'static str {
        match self {
            PayoutNetwork::NativeToWrapped(_) => "native_to_wrapped",
            PayoutNetwork::WrappedToNative(_) => "wrapped_to_native",
            PayoutNetwork::NativeToNative(_) => "native_to_native",
        }
    }

    /// Multiplier converting fees into the payout asset
    ///
    /// Only wrapped-token payouts pay transaction fees in a currency other than the
    /// asset they send; every other variant uses 1.
    pub async fn fee_multiplier(
        &self,
        oracle: Option<&dyn PriceOracle>,
    ) -> Result<BigDecimal, ConnectorError> {
        let PayoutNetwork::NativeToWrapped(network) = self else {
            return Ok(BigDecimal::from(1));
        };
        let (Some(oracle), Some(fee_ticker), Some(asset_ticker)) =
            (oracle, network.fee_ticker.as_deref(), network.asset_ticker.as_deref())
        else {
            return Ok(BigDecimal::from(1));
        };
        if fee_ticker.eq_ignore_ascii_case(asset_ticker) {
            return Ok(BigDecimal::from(1));
        }

        let rate = oracle.conversion_rate(fee_ticker, asset_ticker).await?;
        debug!(fee_ticker, asset_ticker, %rate, "Fee multiplier from price oracle");
        Ok(rate)
    }

    /// Transfer of `amount` of the payout asset to `recipient`, tagged with `memo`
    pub fn build_transfer(&self, recipient: &str, amount: u64, memo: &str) -> Transfer {
        Transfer {
            recipient: recipient.to_string(),
            asset: self.network().asset.clone(),
            amount,
            memo: Some(memo.to_string()),
        }
    }
}
