//! Payout of unprocessed transfer requests
//!
//! Requests are handled one at a time in deposit order. A request leaves UNPROCESSED
//! exactly once: SENT when its payout was announced, FAILED when it can never be paid.
//! Anything that may succeed later (missing rate data, node outages) leaves the
//! request untouched for the next run.

use bigdecimal::BigDecimal;
use eyre::{eyre, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::chain::TimeoutSettings;
use crate::conversion::{ConversionFunction, ConversionRateEngine};
use crate::db::{PayoutDetails, RequestLedger, TransferRequest};
use crate::error::{ErrorKind, PayoutError};
use crate::metrics::Metrics;
use crate::types::RequestStatus;

pub mod facade;
pub mod fees;
pub mod oracle;

pub use facade::PayoutNetwork;
pub use fees::{prepare_send, FeeSettings, PreparedSend};
pub use oracle::{PriceOracle, StaticPriceOracle};

/// Result of one dispatch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// What happened to a single request
#[derive(Debug, Clone, PartialEq)]
pub enum PayoutOutcome {
    Sent(PayoutDetails),
    Failed(String),
    Skipped(String),
}

impl PayoutOutcome {
    fn label(&self) -> &'static str {
        match self {
            PayoutOutcome::Sent(_) => "sent",
            PayoutOutcome::Failed(_) => "failed",
            PayoutOutcome::Skipped(_) => "skipped",
        }
    }
}

pub struct PayoutDispatcher {
    ledger: RequestLedger,
    engine: ConversionRateEngine,
    payout: PayoutNetwork,
    oracle: Option<Arc<dyn PriceOracle>>,
    fees: FeeSettings,
    timeout: TimeoutSettings,
    metrics: Metrics,
}

impl PayoutDispatcher {
    pub fn new(
        ledger: RequestLedger,
        engine: ConversionRateEngine,
        payout: PayoutNetwork,
        fees: FeeSettings,
        timeout: TimeoutSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            engine,
            payout,
            oracle: None,
            fees,
            timeout,
            metrics,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn payout_network(&self) -> &PayoutNetwork {
        &self.payout
    }

    /// Pay out every UNPROCESSED request, strictly sequentially
    pub async fn dispatch(&self) -> Result<DispatchSummary> {
        let requests = self.ledger.requests_by_status(RequestStatus::Unprocessed).await?;
        let kind = self.ledger.kind();
        let mut summary = DispatchSummary::default();

        if requests.is_empty() {
            debug!(kind = %kind, "No unprocessed requests");
            return Ok(summary);
        }
        info!(kind = %kind, count = requests.len(), payout = self.payout.label(), "Dispatching payouts");

        for request in &requests {
            let outcome = self.process_request(request).await?;
            self.metrics
                .payouts
                .with_label_values(&[kind.as_str(), outcome.label()])
                .inc();

            match &outcome {
                PayoutOutcome::Sent(details) => {
                    summary.sent += 1;
                    self.metrics
                        .payout_volume
                        .with_label_values(&[kind.as_str()])
                        .inc_by((details.net_amount + details.total_fee) as f64);
                }
                PayoutOutcome::Failed(_) => summary.failed += 1,
                PayoutOutcome::Skipped(_) => summary.skipped += 1,
            }
        }

        info!(
            kind = %kind,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "Dispatch complete"
        );
        Ok(summary)
    }

    /// Decide and record the fate of one request
    ///
    /// Only database failures are returned as errors.
    pub async fn process_request(&self, request: &TransferRequest) -> Result<PayoutOutcome> {
        let height = request.deposit_transaction_height;

        let calculator = match self.engine.try_create_calculator(height).await {
            Ok(Some(calculator)) if calculator.is_ready() => calculator,
            Ok(_) => {
                debug!(
                    deposit_hash = %request.deposit_transaction_hash,
                    height,
                    "Conversion rate not available yet, skipping"
                );
                return Ok(PayoutOutcome::Skipped("conversion rate not available".to_string()));
            }
            Err(e) => {
                warn!(
                    deposit_hash = %request.deposit_transaction_hash,
                    height,
                    error = %e,
                    "Failed to build conversion rate, skipping"
                );
                return Ok(PayoutOutcome::Skipped(format!("{:#}", e)));
            }
        };

        let fee_multiplier = match self.payout.fee_multiplier(self.oracle.as_deref()).await {
            Ok(multiplier) => multiplier,
            Err(e) => {
                warn!(error = %e, "Fee multiplier unavailable, skipping");
                return Ok(PayoutOutcome::Skipped(e.to_string()));
            }
        };

        let conversion = calculator.to_conversion_function(self.ledger.kind().is_unwrap());
        match self.send(request, &conversion, &fee_multiplier).await {
            Ok(details) => {
                if !self.ledger.mark_payout_sent(request, &details).await? {
                    return Err(self.lost_payout(request, &details));
                }
                info!(
                    deposit_hash = %request.deposit_transaction_hash,
                    subindex = request.deposit_transaction_subindex,
                    payout_hash = %details.transaction_hash,
                    net_amount = details.net_amount,
                    total_fee = details.total_fee,
                    rate = %details.conversion_rate,
                    "Payout sent"
                );
                Ok(PayoutOutcome::Sent(details))
            }
            Err(SendFailure::NotAnnounced(e)) if e.kind() == ErrorKind::Transient => {
                warn!(
                    deposit_hash = %request.deposit_transaction_hash,
                    error = %e,
                    "Transient payout failure, will retry next run"
                );
                Ok(PayoutOutcome::Skipped(e.to_string()))
            }
            Err(SendFailure::NotAnnounced(e)) => {
                let reason = e.to_string();
                self.ledger.mark_payout_failed(request, &reason).await?;
                error!(
                    deposit_hash = %request.deposit_transaction_hash,
                    subindex = request.deposit_transaction_subindex,
                    reason = %reason,
                    "Payout failed"
                );
                Ok(PayoutOutcome::Failed(reason))
            }
            Err(SendFailure::Announced(details, e)) => {
                let reason = e.to_string();
                if !self
                    .ledger
                    .mark_announced_payout_failed(request, &details, &reason)
                    .await?
                {
                    return Err(self.lost_payout(request, &details));
                }
                error!(
                    deposit_hash = %request.deposit_transaction_hash,
                    subindex = request.deposit_transaction_subindex,
                    payout_hash = %details.transaction_hash,
                    reason = %reason,
                    "Announced payout not seen, needs manual review"
                );
                Ok(PayoutOutcome::Failed(reason))
            }
        }
    }

    /// A payout went out but the request had already left UNPROCESSED
    fn lost_payout(&self, request: &TransferRequest, details: &PayoutDetails) -> eyre::Report {
        error!(
            kind = %self.ledger.kind(),
            deposit_hash = %request.deposit_transaction_hash,
            subindex = request.deposit_transaction_subindex,
            payout_hash = %details.transaction_hash,
            net_amount = details.net_amount,
            "Payout announced for a request that is no longer unprocessed"
        );
        eyre!(
            "payout {} for {} request {}:{} could not be recorded: request is no longer unprocessed",
            details.transaction_hash,
            self.ledger.kind(),
            request.deposit_transaction_hash,
            request.deposit_transaction_subindex
        )
    }

    /// Price, sign and announce the payout of `request`
    ///
    /// Once a transaction hash exists every failure carries it, so the caller can
    /// never leave an announced payout UNPROCESSED.
    async fn send(
        &self,
        request: &TransferRequest,
        conversion: &ConversionFunction,
        fee_multiplier: &BigDecimal,
    ) -> std::result::Result<PayoutDetails, SendFailure> {
        let prepared = prepare_send(request, conversion, fee_multiplier, &self.fees)?;
        let connector = self.payout.connector();

        let draft = self.payout.build_transfer(
            &prepared.destination_address,
            prepared.gross_amount,
            &prepared.memo,
        );
        let transaction_fee = connector
            .estimate_transfer_fee(&draft)
            .await
            .map_err(PayoutError::from)?;
        let (net_amount, total_fee) = prepared.net_amount(&self.fees, transaction_fee)?;

        let transfer = self.payout.build_transfer(
            &prepared.destination_address,
            net_amount,
            &prepared.memo,
        );
        let transaction_hash = connector
            .sign_and_announce(&transfer)
            .await
            .map_err(PayoutError::from)?;
        debug!(payout_hash = %transaction_hash, "Payout announced, waiting for unconfirmed status");

        let details = PayoutDetails {
            transaction_hash,
            net_amount,
            total_fee,
            conversion_rate: prepared.conversion_rate,
        };
        match connector
            .wait_for_unconfirmed(&details.transaction_hash, &self.timeout)
            .await
        {
            Ok(true) => Ok(details),
            Ok(false) => {
                let error = PayoutError::UnconfirmedTimeout {
                    transaction_hash: details.transaction_hash.clone(),
                };
                Err(SendFailure::Announced(details, error))
            }
            Err(source) => {
                let error = PayoutError::UnverifiedAnnouncement {
                    transaction_hash: details.transaction_hash.clone(),
                    source,
                };
                Err(SendFailure::Announced(details, error))
            }
        }
    }
}

/// Why a send attempt did not end with a payout in the unconfirmed pool
enum SendFailure {
    /// Nothing left the operator; transient errors may be retried
    NotAnnounced(PayoutError),
    /// A transaction was announced and must never be sent again
    Announced(PayoutDetails, PayoutError),
}

impl From<PayoutError> for SendFailure {
    fn from(error: PayoutError) -> Self {
        SendFailure::NotAnnounced(error)
    }
}
