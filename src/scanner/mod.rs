//! Height-range scanning with a persisted watermark
//!
//! A scan covers `[max(watermark + 1, start_height), finalized + 1 + lookahead)`. Every
//! height is an independent unit of work; the watermark is written once, after all of
//! them succeeded, so a failed scan downloads the whole range again next time.

use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::chain::ChainConnector;
use crate::error::ScanError;
use crate::metrics::Metrics;
use crate::retry::{with_retry, RetryConfig};

pub mod processors;
pub mod throttle;

pub use processors::{BalanceChangeProcessor, TransferRequestProcessor};
pub use throttle::ThrottledConnector;

/// Work done for every height of a scanned range
#[async_trait]
pub trait HeightProcessor: Send + Sync {
    /// Name of the watermark this processor advances
    fn ledger_name(&self) -> &str;

    async fn max_processed_height(&self) -> Result<Option<u64>>;

    async fn set_max_processed_height(&self, height: u64) -> Result<()>;

    /// Download and persist everything the processor needs from `height`
    ///
    /// Must be idempotent: a height is processed again whenever a scan fails.
    async fn process_height(&self, height: u64) -> Result<()>;
}

/// Scanner limits
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    /// Lowest height ever scanned
    pub start_height: u64,
    /// Heights past the finalized height to include
    pub finalization_lookahead: u64,
    /// Concurrent heights in flight
    pub max_concurrency: usize,
    /// Node calls allowed per `rate_limit_period`
    pub rate_limit_calls: u32,
    pub rate_limit_period: Duration,
    pub retry: RetryConfig,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            start_height: 0,
            finalization_lookahead: 0,
            max_concurrency: 20,
            rate_limit_calls: 20,
            rate_limit_period: Duration::from_millis(100),
            retry: RetryConfig::default(),
        }
    }
}

/// Scans one ledger
///
/// Each ledger gets its own scanner, so the semaphore and the rate limiter are never
/// shared between ledgers. Processors must reach the node through
/// [`ChainScanner::connector`] for their calls to count against the limit.
pub struct ChainScanner {
    name: String,
    connector: Arc<dyn ChainConnector>,
    settings: ScannerSettings,
    semaphore: Arc<Semaphore>,
    metrics: Metrics,
}

impl ChainScanner {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn ChainConnector>,
        settings: ScannerSettings,
        metrics: Metrics,
    ) -> Result<Self> {
        let calls = NonZeroU32::new(settings.rate_limit_calls)
            .ok_or_else(|| eyre!("scanner rate limit must allow at least one call"))?;
        if settings.max_concurrency == 0 {
            return Err(eyre!("scanner concurrency must be at least 1"));
        }
        let quota = Quota::with_period(settings.rate_limit_period / calls.get())
            .ok_or_else(|| eyre!("scanner rate limit period must be positive"))?
            .allow_burst(calls);

        let limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            name: name.into(),
            connector: Arc::new(ThrottledConnector::new(connector, limiter)),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency)),
            settings,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scanned chain's connector, rate limited by this scanner
    pub fn connector(&self) -> Arc<dyn ChainConnector> {
        Arc::clone(&self.connector)
    }

    /// Range the next scan of `processor` would cover; `None` when already caught up
    pub async fn next_range(&self, processor: &dyn HeightProcessor) -> Result<Option<Range<u64>>> {
        let next_height = processor
            .max_processed_height()
            .await?
            .map_or(0, |max| max + 1);
        let start = next_height.max(self.settings.start_height);

        let finalized = self.connector.current_finalized_height().await?;
        let end = finalized + 1 + self.settings.finalization_lookahead;

        Ok((start < end).then_some(start..end))
    }

    /// Process every height of the next range and advance the watermark
    ///
    /// Returns the scanned range, or `None` if there was nothing to do.
    pub async fn scan(&self, processor: &dyn HeightProcessor) -> Result<Option<Range<u64>>> {
        let Some(range) = self.next_range(processor).await? else {
            debug!(chain = %self.name, ledger = processor.ledger_name(), "Nothing to scan");
            return Ok(None);
        };

        info!(
            chain = %self.name,
            ledger = processor.ledger_name(),
            start = range.start,
            end = range.end,
            "Scanning heights"
        );

        let result = stream::iter(range.clone())
            .map(Ok::<u64, eyre::Report>)
            .try_for_each_concurrent(self.settings.max_concurrency, |height| {
                self.process_unit(processor, height)
            })
            .await;

        if let Err(e) = result {
            self.metrics
                .scan_failures
                .with_label_values(&[processor.ledger_name()])
                .inc();
            error!(
                chain = %self.name,
                ledger = processor.ledger_name(),
                start = range.start,
                end = range.end,
                error = %e,
                "Scan abandoned, watermark not advanced"
            );
            return Err(e);
        }

        let last = range.end - 1;
        processor.set_max_processed_height(last).await?;
        self.metrics
            .watermark
            .with_label_values(&[processor.ledger_name()])
            .set(i64::try_from(last).unwrap_or(i64::MAX));

        info!(
            chain = %self.name,
            ledger = processor.ledger_name(),
            watermark = last,
            "Scan complete"
        );
        Ok(Some(range))
    }

    async fn process_unit(&self, processor: &dyn HeightProcessor, height: u64) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| eyre!("scanner {} semaphore closed", self.name))?;

        let outcome = with_retry(&self.settings.retry, move |_| processor.process_height(height)).await;

        match outcome {
            Ok(()) => {
                self.metrics
                    .heights_scanned
                    .with_label_values(&[processor.ledger_name()])
                    .inc();
                Ok(())
            }
            Err(failure) if failure.exhausted() => Err(ScanError::RetriesExhausted {
                ledger: processor.ledger_name().to_string(),
                height,
                attempts: failure.attempts,
                message: format!("{:#}", failure.error),
            }
            .into()),
            Err(failure) => Err(ScanError::Permanent {
                ledger: processor.ledger_name().to_string(),
                height,
                message: format!("{:#}", failure.error),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockTimestamps, Network};
    use crate::db::{test_pool, BalanceChangeLedger, RequestLedger};
    use crate::error::{classify_report, ErrorKind};
    use crate::testing::{incoming, MockConnector};
    use crate::types::{Asset, RequestKind, RequestStatus};
    use std::time::Instant;

    fn fast_settings(start_height: u64) -> ScannerSettings {
        ScannerSettings {
            start_height,
            retry: RetryConfig::fixed(3, Duration::from_millis(1)),
            ..Default::default()
        }
    }

    async fn balance_fixture(
        start_height: u64,
        finalized: u64,
    ) -> (MockConnector, ChainScanner, BalanceChangeProcessor, BalanceChangeLedger) {
        let connector = MockConnector::new("T");
        connector.set_finalized_height(finalized);
        let ledger = BalanceChangeLedger::new(test_pool().await);
        let scanner = ChainScanner::new(
            "nem",
            Arc::new(connector.clone()),
            fast_settings(start_height),
            Metrics::new().unwrap(),
        )
        .unwrap();
        let network = Network {
            connector: scanner.connector(),
            ..connector.network("nem", "TBRIDGE", Asset::Native)
        };
        let processor = BalanceChangeProcessor::new(network, ledger.clone());
        (connector, scanner, processor, ledger)
    }

    #[tokio::test]
    async fn test_range_respects_start_height_and_lookahead() {
        let (connector, _, processor, ledger) = balance_fixture(100, 104).await;
        let settings = ScannerSettings {
            finalization_lookahead: 2,
            ..fast_settings(100)
        };
        let scanner = ChainScanner::new(
            "nem",
            Arc::new(connector.clone()),
            settings,
            Metrics::new().unwrap(),
        )
        .unwrap();

        assert_eq!(scanner.next_range(&processor).await.unwrap(), Some(100..107));

        ledger.set_max_processed_height(106).await.unwrap();
        assert_eq!(scanner.next_range(&processor).await.unwrap(), None);

        connector.set_finalized_height(110);
        assert_eq!(scanner.next_range(&processor).await.unwrap(), Some(107..113));
    }

    #[tokio::test]
    async fn test_scan_advances_watermark_after_all_heights() {
        let (connector, scanner, processor, ledger) = balance_fixture(100, 104).await;
        connector.set_balance_change(101, 500);
        connector.set_balance_change(104, -200);

        let range = scanner.scan(&processor).await.unwrap();
        assert_eq!(range, Some(100..105));
        assert_eq!(ledger.max_processed_height().await.unwrap(), Some(104));
        assert_eq!(ledger.balance_at(104).await.unwrap(), 300);

        // caught up
        assert_eq!(scanner.scan(&processor).await.unwrap(), None);
        assert_eq!(connector.download_calls(104), 1);
    }

    #[tokio::test]
    async fn test_exhausted_height_blocks_watermark() {
        let (connector, scanner, processor, ledger) = balance_fixture(100, 104).await;
        connector.set_balance_change(101, 500);
        connector.fail_height(103, u32::MAX);

        let err = scanner.scan(&processor).await.unwrap_err();
        assert_eq!(classify_report(&err), ErrorKind::ScanIntegrity);
        match err.downcast_ref::<ScanError>() {
            Some(ScanError::RetriesExhausted { height, attempts, .. }) => {
                assert_eq!(*height, 103);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(ledger.max_processed_height().await.unwrap(), None);
        assert_eq!(connector.download_calls(103), 3);
        assert_eq!(connector.download_calls(100), 1);

        // node recovered: the whole range is downloaded again
        connector.fail_height(103, 0);
        assert_eq!(scanner.scan(&processor).await.unwrap(), Some(100..105));
        assert_eq!(ledger.max_processed_height().await.unwrap(), Some(104));
        assert_eq!(connector.download_calls(100), 2);
        assert_eq!(connector.download_calls(103), 4);
        assert_eq!(ledger.balance_at(104).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_transient_failure_within_retry_limit() {
        let (connector, scanner, processor, ledger) = balance_fixture(0, 3).await;
        connector.fail_height(2, 2);

        assert_eq!(scanner.scan(&processor).await.unwrap(), Some(0..4));
        assert_eq!(connector.download_calls(2), 3);
        assert_eq!(ledger.max_processed_height().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_every_node_call_takes_a_token() {
        let pool = test_pool().await;
        let native = MockConnector::new("T").with_block_time(0, 60);
        // five deposits in one block: three pages of two
        for subindex in 0..5 {
            native.add_transfer(incoming("d1", subindex, 0, 100, "0xdest"));
        }
        let settings = ScannerSettings {
            rate_limit_calls: 1,
            rate_limit_period: Duration::from_millis(50),
            ..fast_settings(0)
        };
        let scanner = ChainScanner::new("nem", Arc::new(native.clone()), settings, Metrics::new().unwrap()).unwrap();
        let ledger = RequestLedger::new(pool.clone(), RequestKind::Wrap);
        let network = Network {
            connector: scanner.connector(),
            ..native.network("nem", "TBRIDGE", Asset::Native)
        };
        let processor = TransferRequestProcessor::new(
            network,
            Arc::new(MockConnector::new("0x")),
            ledger.clone(),
            BlockTimestamps::new(pool, "nem", scanner.connector()),
            Metrics::new().unwrap(),
        );

        let started = Instant::now();
        assert_eq!(scanner.scan(&processor).await.unwrap(), Some(0..1));
        // finalized height, three pages and one block timestamp
        assert!(started.elapsed() >= Duration::from_millis(180), "{:?}", started.elapsed());
        assert_eq!(ledger.requests_by_status(RequestStatus::Unprocessed).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_scanners_do_not_share_limits() {
        let connector: Arc<dyn ChainConnector> = Arc::new(MockConnector::new("T"));
        let settings = ScannerSettings {
            rate_limit_calls: 1,
            rate_limit_period: Duration::from_secs(60),
            ..Default::default()
        };
        let first = ChainScanner::new("nem", connector.clone(), settings.clone(), Metrics::new().unwrap()).unwrap();
        let second = ChainScanner::new("nem", connector, settings, Metrics::new().unwrap()).unwrap();

        first.connector().current_finalized_height().await.unwrap();
        // the first scanner's single token is spent, the second still has its own
        tokio::time::timeout(Duration::from_secs(1), second.connector().current_finalized_height())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_invalid_limits_are_rejected() {
        let connector: Arc<dyn ChainConnector> = Arc::new(MockConnector::new("T"));
        let settings = ScannerSettings {
            rate_limit_calls: 0,
            ..Default::default()
        };
        assert!(ChainScanner::new("nem", connector.clone(), settings, Metrics::new().unwrap()).is_err());

        let settings = ScannerSettings {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(ChainScanner::new("nem", connector, settings, Metrics::new().unwrap()).is_err());
    }
}
