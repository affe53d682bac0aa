//! Conversion rate between the native asset and its wrapped counterpart
//!
//! The rate is derived from three balance snapshots taken one height before the
//! height being priced, so a deposit never influences its own price:
//!
//! - native balance: the bridge account balance on the native chain
//! - wrapped balance: gross wrapped amount issued for wrap requests
//! - unwrapped balance: wrapped amount returned to the bridge by unwrap requests
//!
//! `rate = (wrapped - unwrapped) / native`. All conversions truncate so the bridge
//! never pays out more value than it received.

use bigdecimal::BigDecimal;
use eyre::{eyre, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::{BlockTimestamps, ChainConnector};
use crate::db::{BalanceChangeLedger, RequestLedger};
use crate::types::RequestKind;

/// Conversion rate snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionRateCalculator {
    native_balance: u64,
    wrapped_balance: u64,
    unwrapped_balance: u64,
}

impl ConversionRateCalculator {
    pub fn new(native_balance: u64, wrapped_balance: u64, unwrapped_balance: u64) -> Self {
        Self {
            native_balance,
            wrapped_balance,
            unwrapped_balance,
        }
    }

    /// Neutral calculator used when no height has complete data
    pub fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Calculator applying a fixed multiplier (native-to-native bridges)
    ///
    /// The multiplier is kept exact by scaling both sides by its decimal precision.
    pub fn fixed(multiplier: &BigDecimal) -> Result<Self> {
        let (native, wrapped) = multiplier_ratio(multiplier)?;
        Ok(Self::new(native, wrapped, 0))
    }

    pub fn native_balance(&self) -> u64 {
        self.native_balance
    }

    pub fn wrapped_balance(&self) -> u64 {
        self.wrapped_balance
    }

    pub fn unwrapped_balance(&self) -> u64 {
        self.unwrapped_balance
    }

    /// Wrapped amount still outstanding
    fn outstanding(&self) -> u64 {
        self.wrapped_balance.saturating_sub(self.unwrapped_balance)
    }

    /// A calculator without native balance cannot price anything
    pub fn is_ready(&self) -> bool {
        self.native_balance > 0
    }

    /// Wrapped units per native unit; zero when undefined
    pub fn rate(&self) -> BigDecimal {
        if self.native_balance == 0 {
            return BigDecimal::from(0u64);
        }
        BigDecimal::from(self.outstanding()) / BigDecimal::from(self.native_balance)
    }

    /// `floor(amount × rate)`
    pub fn to_wrapped_amount(&self, amount: u64) -> u64 {
        if self.native_balance == 0 {
            return 0;
        }
        let converted =
            u128::from(amount) * u128::from(self.outstanding()) / u128::from(self.native_balance);
        u64::try_from(converted).unwrap_or(u64::MAX)
    }

    /// `floor(amount / rate)`
    pub fn to_native_amount(&self, amount: u64) -> u64 {
        let outstanding = self.outstanding();
        if outstanding == 0 {
            return 0;
        }
        let converted =
            u128::from(amount) * u128::from(self.native_balance) / u128::from(outstanding);
        u64::try_from(converted).unwrap_or(u64::MAX)
    }

    /// Conversion applied to deposits of the given direction
    pub fn to_conversion_function(&self, is_unwrap: bool) -> ConversionFunction {
        ConversionFunction {
            calculator: *self,
            is_unwrap,
        }
    }
}

/// Direction-bound conversion of deposit amounts into payout amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionFunction {
    calculator: ConversionRateCalculator,
    is_unwrap: bool,
}

impl ConversionFunction {
    pub fn convert(&self, amount: u64) -> u64 {
        if self.is_unwrap {
            self.calculator.to_native_amount(amount)
        } else {
            self.calculator.to_wrapped_amount(amount)
        }
    }

    pub fn calculator(&self) -> &ConversionRateCalculator {
        &self.calculator
    }
}

/// Split a decimal multiplier into an exact `(native, wrapped)` integer ratio
fn multiplier_ratio(multiplier: &BigDecimal) -> Result<(u64, u64)> {
    use bigdecimal::ToPrimitive;

    let (digits, scale) = multiplier.normalized().as_bigint_and_exponent();
    let digits = digits
        .to_u64()
        .ok_or_else(|| eyre!("multiplier {} must be a non-negative value fitting u64", multiplier))?;

    if scale >= 0 {
        let native = 10u64
            .checked_pow(u32::try_from(scale)?)
            .ok_or_else(|| eyre!("multiplier {} has too many decimal places", multiplier))?;
        Ok((native, digits))
    } else {
        let factor = 10u64
            .checked_pow(u32::try_from(-scale)?)
            .ok_or_else(|| eyre!("multiplier {} is too large", multiplier))?;
        let wrapped = digits
            .checked_mul(factor)
            .ok_or_else(|| eyre!("multiplier {} is too large", multiplier))?;
        Ok((1, wrapped))
    }
}

/// Where the rate comes from
#[derive(Debug, Clone, PartialEq)]
pub enum RateSource {
    /// Balance snapshots of the native account and both request ledgers
    Reserves,
    /// Fixed multiplier between two native currencies
    Fixed(BigDecimal),
}

/// Produces conversion rate calculators for deposits of one direction
#[derive(Clone)]
pub struct ConversionRateEngine {
    direction: RequestKind,
    source: RateSource,
    balances: BalanceChangeLedger,
    wrap_requests: RequestLedger,
    unwrap_requests: RequestLedger,
    native_timestamps: BlockTimestamps,
    wrapped_timestamps: BlockTimestamps,
    native_connector: Arc<dyn ChainConnector>,
}

impl ConversionRateEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: RequestKind,
        source: RateSource,
        balances: BalanceChangeLedger,
        wrap_requests: RequestLedger,
        unwrap_requests: RequestLedger,
        native_timestamps: BlockTimestamps,
        wrapped_timestamps: BlockTimestamps,
        native_connector: Arc<dyn ChainConnector>,
    ) -> Self {
        Self {
            direction,
            source,
            balances,
            wrap_requests,
            unwrap_requests,
            native_timestamps,
            wrapped_timestamps,
            native_connector,
        }
    }

    pub fn is_unwrap(&self) -> bool {
        self.direction.is_unwrap()
    }

    /// Ledger holding the deposits this engine prices
    fn deposit_ledger(&self) -> &RequestLedger {
        if self.is_unwrap() {
            &self.unwrap_requests
        } else {
            &self.wrap_requests
        }
    }

    /// Calculator for a deposit at `height` on the deposit chain
    ///
    /// Returns `None` unless every data source is synced far enough.
    pub async fn try_create_calculator(&self, height: u64) -> Result<Option<ConversionRateCalculator>> {
        if let RateSource::Fixed(multiplier) = &self.source {
            let synced = self.deposit_ledger().max_processed_height().await?;
            if synced.map_or(true, |max| max < height) {
                return Ok(None);
            }
            return ConversionRateCalculator::fixed(multiplier).map(Some);
        }

        let native_height = if self.is_unwrap() {
            let timestamp = self.wrapped_timestamps.timestamp(height).await?;
            self.native_connector.block_height(timestamp).await?
        } else {
            height
        };
        if native_height == 0 {
            return Ok(None);
        }
        let lookup_height = native_height - 1;

        if !self.is_synced(&self.balances.max_processed_height().await?, lookup_height) {
            debug!(lookup_height, "Native balance index not synced");
            return Ok(None);
        }
        if !self.is_synced(&self.wrap_requests.max_processed_height().await?, lookup_height) {
            debug!(lookup_height, "Wrap request ledger not synced");
            return Ok(None);
        }

        let lookup_timestamp = self.native_timestamps.timestamp(lookup_height).await?;
        let redemption_synced = match self.unwrap_requests.max_processed_height().await? {
            Some(max) => self.wrapped_timestamps.timestamp(max).await? >= lookup_timestamp,
            None => false,
        };
        if !redemption_synced {
            debug!(lookup_height, %lookup_timestamp, "Unwrap request ledger not synced");
            return Ok(None);
        }

        let native_balance = self.balances.balance_at(lookup_height).await?;
        let wrapped_balance = self.wrap_requests.cumulative_gross_payout_at(lookup_height).await?;
        let unwrapped_balance = self
            .unwrap_requests
            .cumulative_amount_at(self.wrapped_timestamps.network(), lookup_timestamp)
            .await?;

        Ok(Some(ConversionRateCalculator::new(
            native_balance,
            wrapped_balance,
            unwrapped_balance,
        )))
    }

    fn is_synced(&self, max_processed: &Option<u64>, height: u64) -> bool {
        max_processed.map_or(false, |max| max >= height)
    }

    /// Calculator at the highest height with complete data
    ///
    /// Walks backward from the deposit ledger's watermark. Falls back to
    /// [`ConversionRateCalculator::zero`], which callers must treat as not ready.
    pub async fn create_best_calculator(&self) -> Result<ConversionRateCalculator> {
        let Some(mut height) = self.deposit_ledger().max_processed_height().await? else {
            return Ok(ConversionRateCalculator::zero());
        };

        loop {
            if let Some(calculator) = self.try_create_calculator(height).await? {
                info!(
                    direction = %self.direction,
                    height,
                    rate = %calculator.rate(),
                    "Best conversion rate calculator found"
                );
                return Ok(calculator);
            }
            if height == 0 {
                break;
            }
            height -= 1;
        }

        Ok(ConversionRateCalculator::zero())
    }
}
