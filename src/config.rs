use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::TimeoutSettings;
use crate::payout::FeeSettings;
use crate::retry::RetryConfig;
use crate::scanner::ScannerSettings;
use crate::types::{Asset, BridgeMode};

/// Main configuration for the bridge operator
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub bridge: BridgeConfig,
    pub native: NetworkConfig,
    pub wrapped: NetworkConfig,
    pub fees: FeeConfig,
    pub scanner: ScannerConfig,
    pub operator: OperatorConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// How the two networks relate
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// Wrapped-side units paid per native unit in swap mode
    #[serde(default)]
    pub native_to_native_multiplier: Option<BigDecimal>,
}

/// One side of the bridge
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Network name used for logging and the block timestamp cache
    pub name: String,
    pub bridge_address: String,
    pub asset: Asset,
    #[serde(default)]
    pub asset_ticker: Option<String>,
    #[serde(default)]
    pub fee_ticker: Option<String>,
    /// First height scanned for deposits
    #[serde(default)]
    pub start_height: u64,
    #[serde(default)]
    pub finalization_lookahead: u64,
}

/// Fee configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_percentage_conversion_fee")]
    pub percentage_conversion_fee: BigDecimal,
    pub max_transfer_amount: u64,
}

/// Limits of the per-height downloader
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_rate_limit_calls")]
    pub rate_limit_calls: u32,
    #[serde(default = "default_rate_limit_period")]
    pub rate_limit_period_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Workflow loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_lifetime_hours")]
    pub request_lifetime_hours: u32,
    #[serde(default = "default_unconfirmed_wait_retries")]
    pub unconfirmed_wait_retries: u32,
    #[serde(default = "default_unconfirmed_wait_interval")]
    pub unconfirmed_wait_interval_ms: u64,
}

/// Default functions
fn default_percentage_conversion_fee() -> BigDecimal {
    BigDecimal::from(0)
}

fn default_max_concurrency() -> usize {
    20
}

fn default_rate_limit_calls() -> u32 {
    20
}

fn default_rate_limit_period() -> u64 {
    100
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_request_lifetime_hours() -> u32 {
    24
}

fn default_unconfirmed_wait_retries() -> u32 {
    12
}

fn default_unconfirmed_wait_interval() -> u64 {
    5000
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let bridge = BridgeConfig {
            mode: env::var("BRIDGE_MODE")
                .unwrap_or_else(|_| "wrapped".to_string())
                .parse()?,
            native_to_native_multiplier: env::var("NATIVE_TO_NATIVE_MULTIPLIER")
                .ok()
                .map(|v| BigDecimal::from_str(&v))
                .transpose()
                .wrap_err("NATIVE_TO_NATIVE_MULTIPLIER must be a decimal number")?,
        };

        let fees = FeeConfig {
            percentage_conversion_fee: env::var("PERCENTAGE_CONVERSION_FEE")
                .ok()
                .map(|v| BigDecimal::from_str(&v))
                .transpose()
                .wrap_err("PERCENTAGE_CONVERSION_FEE must be a decimal number")?
                .unwrap_or_else(default_percentage_conversion_fee),
            max_transfer_amount: required("MAX_TRANSFER_AMOUNT")?
                .parse()
                .wrap_err("MAX_TRANSFER_AMOUNT must be a valid u64")?,
        };

        let scanner = ScannerConfig {
            max_concurrency: optional("SCAN_MAX_CONCURRENCY", default_max_concurrency()),
            rate_limit_calls: optional("SCAN_RATE_LIMIT_CALLS", default_rate_limit_calls()),
            rate_limit_period_ms: optional("SCAN_RATE_LIMIT_PERIOD_MS", default_rate_limit_period()),
            retry_attempts: optional("SCAN_RETRY_ATTEMPTS", default_retry_attempts()),
            retry_delay_ms: optional("SCAN_RETRY_DELAY_MS", default_retry_delay()),
        };

        let operator = OperatorConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS", default_poll_interval()),
            request_lifetime_hours: optional(
                "REQUEST_LIFETIME_HOURS",
                default_request_lifetime_hours(),
            ),
            unconfirmed_wait_retries: optional(
                "UNCONFIRMED_WAIT_RETRIES",
                default_unconfirmed_wait_retries(),
            ),
            unconfirmed_wait_interval_ms: optional(
                "UNCONFIRMED_WAIT_INTERVAL_MS",
                default_unconfirmed_wait_interval(),
            ),
        };

        let config = Config {
            database,
            bridge,
            native: load_network("NATIVE")?,
            wrapped: load_network("WRAPPED")?,
            fees,
            scanner,
            operator,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for (side, network) in [("native", &self.native), ("wrapped", &self.wrapped)] {
            if network.name.is_empty() {
                return Err(eyre!("{}.name cannot be empty", side));
            }
            if network.bridge_address.is_empty() {
                return Err(eyre!("{}.bridge_address cannot be empty", side));
            }
        }
        // the timestamp cache is keyed by network name
        if self.native.name == self.wrapped.name {
            return Err(eyre!("native and wrapped networks must have different names"));
        }

        match (self.bridge.mode, &self.bridge.native_to_native_multiplier) {
            (BridgeMode::Swap, None) => {
                return Err(eyre!("bridge.native_to_native_multiplier is required in swap mode"));
            }
            (BridgeMode::Swap, Some(multiplier)) if *multiplier <= BigDecimal::from(0) => {
                return Err(eyre!("bridge.native_to_native_multiplier must be positive"));
            }
            _ => {}
        }

        let fee = &self.fees.percentage_conversion_fee;
        if *fee < BigDecimal::from(0) || *fee >= BigDecimal::from(1) {
            return Err(eyre!("fees.percentage_conversion_fee must be in [0, 1)"));
        }
        if self.fees.max_transfer_amount == 0 {
            return Err(eyre!("fees.max_transfer_amount must be positive"));
        }

        if self.scanner.max_concurrency == 0 {
            return Err(eyre!("scanner.max_concurrency must be at least 1"));
        }
        if self.scanner.rate_limit_calls == 0 || self.scanner.rate_limit_period_ms == 0 {
            return Err(eyre!("scanner rate limit must allow calls over a positive period"));
        }
        if self.scanner.retry_attempts == 0 {
            return Err(eyre!("scanner.retry_attempts must be at least 1"));
        }

        if self.operator.poll_interval_ms == 0 {
            return Err(eyre!("operator.poll_interval_ms must be positive"));
        }
        if self.operator.request_lifetime_hours == 0 {
            return Err(eyre!("operator.request_lifetime_hours must be positive"));
        }

        Ok(())
    }

    /// Scanner limits for one of the two networks
    pub fn scanner_settings(&self, network: &NetworkConfig) -> ScannerSettings {
        ScannerSettings {
            start_height: network.start_height,
            finalization_lookahead: network.finalization_lookahead,
            max_concurrency: self.scanner.max_concurrency,
            rate_limit_calls: self.scanner.rate_limit_calls,
            rate_limit_period: Duration::from_millis(self.scanner.rate_limit_period_ms),
            retry: RetryConfig::fixed(
                self.scanner.retry_attempts,
                Duration::from_millis(self.scanner.retry_delay_ms),
            ),
        }
    }

    pub fn fee_settings(&self) -> FeeSettings {
        FeeSettings {
            percentage_conversion_fee: self.fees.percentage_conversion_fee.clone(),
            max_transfer_amount: self.fees.max_transfer_amount,
        }
    }

    pub fn timeout_settings(&self) -> TimeoutSettings {
        TimeoutSettings {
            retry_count: self.operator.unconfirmed_wait_retries,
            interval: Duration::from_millis(self.operator.unconfirmed_wait_interval_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.operator.poll_interval_ms)
    }
}

/// Read `{prefix}_NETWORK_NAME`, `{prefix}_BRIDGE_ADDRESS`, ...
fn load_network(prefix: &str) -> Result<NetworkConfig> {
    let var = |suffix: &str| format!("{}_{}", prefix, suffix);

    Ok(NetworkConfig {
        name: required(&var("NETWORK_NAME"))?,
        bridge_address: required(&var("BRIDGE_ADDRESS"))?,
        asset: env::var(var("ASSET"))
            .unwrap_or_default()
            .parse()
            .unwrap_or(Asset::Native),
        asset_ticker: env::var(var("ASSET_TICKER")).ok(),
        fee_ticker: env::var(var("FEE_TICKER")).ok(),
        start_height: optional(&var("START_HEIGHT"), 0),
        finalization_lookahead: optional(&var("FINALIZATION_LOOKAHEAD"), 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(name: &str) -> NetworkConfig {
        NetworkConfig {
            name: name.to_string(),
            bridge_address: format!("{}-bridge", name),
            asset: Asset::Native,
            asset_ticker: None,
            fee_ticker: None,
            start_height: 0,
            finalization_lookahead: 0,
        }
    }

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "sqlite://bridge.db".to_string(),
            },
            bridge: BridgeConfig {
                mode: BridgeMode::Wrapped,
                native_to_native_multiplier: None,
            },
            native: network("nem"),
            wrapped: network("ethereum"),
            fees: FeeConfig {
                percentage_conversion_fee: BigDecimal::from_str("0.003").unwrap(),
                max_transfer_amount: 1_000_000,
            },
            scanner: ScannerConfig {
                max_concurrency: default_max_concurrency(),
                rate_limit_calls: default_rate_limit_calls(),
                rate_limit_period_ms: default_rate_limit_period(),
                retry_attempts: default_retry_attempts(),
                retry_delay_ms: default_retry_delay(),
            },
            operator: OperatorConfig {
                poll_interval_ms: default_poll_interval(),
                request_lifetime_hours: default_request_lifetime_hours(),
                unconfirmed_wait_retries: default_unconfirmed_wait_retries(),
                unconfirmed_wait_interval_ms: default_unconfirmed_wait_interval(),
            },
        }
    }

    #[test]
    fn test_scanner_defaults() {
        assert_eq!(default_max_concurrency(), 20);
        assert_eq!(default_rate_limit_calls(), 20);
        assert_eq!(default_rate_limit_period(), 100);
        assert_eq!(default_retry_attempts(), 10);
        assert_eq!(default_retry_delay(), 1000);
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_swap_mode_requires_positive_multiplier() {
        let mut config = valid_config();
        config.bridge.mode = BridgeMode::Swap;
        assert!(config.validate().is_err());

        config.bridge.native_to_native_multiplier = Some(BigDecimal::from(0));
        assert!(config.validate().is_err());

        config.bridge.native_to_native_multiplier = Some(BigDecimal::from_str("0.5").unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_percentage_fee_bounds() {
        let mut config = valid_config();
        config.fees.percentage_conversion_fee = BigDecimal::from(1);
        assert!(config.validate().is_err());

        config.fees.percentage_conversion_fee = BigDecimal::from(-1);
        assert!(config.validate().is_err());

        config.fees.percentage_conversion_fee = BigDecimal::from(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_network_names_must_differ() {
        let mut config = valid_config();
        config.wrapped.name = "nem".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = valid_config();
        config.scanner.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.scanner.retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.fees.max_transfer_amount = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = valid_config();
        config.native.start_height = 500;
        config.native.finalization_lookahead = 3;

        let scanner = config.scanner_settings(&config.native);
        assert_eq!(scanner.start_height, 500);
        assert_eq!(scanner.finalization_lookahead, 3);
        assert_eq!(scanner.retry.max_attempts, 10);
        assert_eq!(scanner.retry.backoff_for_retry(3), Duration::from_secs(1));

        let timeout = config.timeout_settings();
        assert_eq!(timeout.retry_count, 12);
        assert_eq!(timeout.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_database_url_redacted() {
        let config = valid_config();
        let debug = format!("{:?}", config.database);
        assert!(!debug.contains("bridge.db"));
        assert!(debug.contains("<redacted>"));
    }
}
