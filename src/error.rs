//! Error taxonomy for the bridge workflows
//!
//! Infrastructure failures travel as `eyre::Report`; the typed errors here carry enough
//! information for call sites to decide between skipping, retrying and failing a request.

use thiserror::Error;

/// How a failure should be handled by the workflow that observed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Balance or height data is missing; skip and look again on the next run
    DataNotReady,
    /// Node connectivity or timeout; retry a bounded number of times
    Transient,
    /// Terminal rejection recorded against the request and never retried
    Permanent,
    /// A height could not be downloaded; the whole scan is abandoned
    ScanIntegrity,
}

/// Errors reported by a chain connector
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The node could not be reached or did not answer in time
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// The node answered but refused the request or transaction
    #[error("request rejected by node: {0}")]
    Rejected(String),

    /// The node returned data that could not be interpreted
    #[error("malformed node response: {0}")]
    Malformed(String),
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Unavailable(_) => ErrorKind::Transient,
            ConnectorError::Rejected(_) | ConnectorError::Malformed(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Outcome of a payout attempt that did not produce a sent transaction
#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("gross amount {amount} exceeds maximum transfer amount {maximum}")]
    ExceedsMaximum { amount: u64, maximum: u64 },

    #[error("total fee {fee} meets or exceeds gross amount {amount}")]
    FeeExceedsAmount { amount: u64, fee: u64 },

    #[error("transaction {transaction_hash} did not reach the unconfirmed pool in time")]
    UnconfirmedTimeout { transaction_hash: String },

    #[error("transaction {transaction_hash} was announced but its status is unknown: {source}")]
    UnverifiedAnnouncement {
        transaction_hash: String,
        source: ConnectorError,
    },

    #[error(transparent)]
    Node(#[from] ConnectorError),
}

impl PayoutError {
    /// Announced-but-unseen transactions are treated as permanent so the same
    /// deposit can never be paid out twice.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PayoutError::Node(e) => e.kind(),
            PayoutError::ExceedsMaximum { .. }
            | PayoutError::FeeExceedsAmount { .. }
            | PayoutError::UnconfirmedTimeout { .. }
            | PayoutError::UnverifiedAnnouncement { .. } => ErrorKind::Permanent,
        }
    }
}

/// Errors that abort a scan without advancing its watermark
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{ledger}: height {height} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        ledger: String,
        height: u64,
        attempts: u32,
        message: String,
    },

    #[error("{ledger}: height {height} failed permanently: {message}")]
    Permanent {
        ledger: String,
        height: u64,
        message: String,
    },
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ScanIntegrity
    }
}

/// Classify an arbitrary workflow error
///
/// Connector errors keep their own kind; anything else (database, configuration) is
/// an infrastructure fault and surfaces as permanent for the current run.
pub fn classify_report(report: &eyre::Report) -> ErrorKind {
    if let Some(e) = report.downcast_ref::<ConnectorError>() {
        return e.kind();
    }
    if let Some(e) = report.downcast_ref::<PayoutError>() {
        return e.kind();
    }
    if report.downcast_ref::<ScanError>().is_some() {
        return ErrorKind::ScanIntegrity;
    }
    ErrorKind::Permanent
}
