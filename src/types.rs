//! Common types shared by the ledger, scanner and payout workflows.

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a transfer request
///
/// Stored as lowercase text in the `transfer_requests.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Unprocessed,
    Sent,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Unprocessed => "unprocessed",
            RequestStatus::Sent => "sent",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unprocessed" => Ok(RequestStatus::Unprocessed),
            "sent" => Ok(RequestStatus::Sent),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(eyre!("unknown request status '{}'", other)),
        }
    }
}

/// Direction of a transfer request
///
/// Wrap requests are deposits on the native chain paid out on the wrapped chain,
/// unwrap requests are deposits on the wrapped chain paid out on the native chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Wrap,
    Unwrap,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Wrap => "wrap",
            RequestKind::Unwrap => "unwrap",
        }
    }

    pub fn is_unwrap(&self) -> bool {
        matches!(self, RequestKind::Unwrap)
    }

    /// Watermark key of the ledger holding requests of this kind
    pub fn ledger_name(&self) -> &'static str {
        match self {
            RequestKind::Wrap => "wrap_requests",
            RequestKind::Unwrap => "unwrap_requests",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the two sides of the bridge relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// The wrapped chain carries a token minted against native deposits
    Wrapped,
    /// Both sides pay out their own native currency at a fixed multiplier
    Swap,
}

impl FromStr for BridgeMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "wrapped" => Ok(BridgeMode::Wrapped),
            "swap" | "native" => Ok(BridgeMode::Swap),
            other => Err(eyre!("unknown bridge mode '{}'", other)),
        }
    }
}

/// Asset moved by a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// The chain's own currency
    Native,
    /// A token identified by its contract address or mosaic id
    Token(String),
}

impl FromStr for Asset {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("native") {
            Ok(Asset::Native)
        } else {
            Ok(Asset::Token(trimmed.to_string()))
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Token(id) => write!(f, "{}", id),
        }
    }
}
