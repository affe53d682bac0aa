//! Wiring of the bridge workflows
//!
//! [`BridgeContext`] is built once at startup and owns everything shared between the
//! workflows. [`WorkflowManager`] runs scan, dispatch and reconcile cycles until it is
//! told to stop.

use bigdecimal::ToPrimitive;
use eyre::{eyre, Result};
use sqlx::sqlite::SqlitePool;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::chain::{BlockTimestamps, ChainConnector, Network};
use crate::config::{Config, NetworkConfig};
use crate::conversion::{ConversionRateEngine, RateSource};
use crate::db::{self, BalanceChangeLedger, RequestLedger};
use crate::metrics::Metrics;
use crate::payout::{DispatchSummary, PayoutDispatcher, PayoutNetwork, PriceOracle};
use crate::reconciler::{FinalizationReconciler, ReconcileSummary};
use crate::retry::RetryConfig;
use crate::scanner::{BalanceChangeProcessor, ChainScanner, HeightProcessor, TransferRequestProcessor};
use crate::types::{BridgeMode, RequestKind};

/// Heartbeat every N cycles
const HEARTBEAT_CYCLES: u64 = 10;

/// Longest pause after repeated cycle failures
const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(300);

/// Shared state of one bridge
pub struct BridgeContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub native: Network,
    pub wrapped: Network,
    pub metrics: Metrics,
    pub oracle: Option<Arc<dyn PriceOracle>>,
}

impl BridgeContext {
    /// Connect to the database, apply migrations and bind the connectors
    pub async fn new(
        config: Config,
        native_connector: Arc<dyn ChainConnector>,
        wrapped_connector: Arc<dyn ChainConnector>,
    ) -> Result<Self> {
        let pool = db::create_pool(&config.database.url).await?;
        db::run_migrations(&pool).await?;

        let native = network(&config.native, native_connector);
        let wrapped = network(&config.wrapped, wrapped_connector);

        Ok(Self {
            config,
            pool,
            native,
            wrapped,
            metrics: Metrics::new()?,
            oracle: None,
        })
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn balances(&self) -> BalanceChangeLedger {
        BalanceChangeLedger::new(self.pool.clone())
    }

    pub fn requests(&self, kind: RequestKind) -> RequestLedger {
        RequestLedger::new(self.pool.clone(), kind)
    }

    pub fn timestamps(&self, network: &Network) -> BlockTimestamps {
        BlockTimestamps::new(self.pool.clone(), network.name.clone(), network.connector.clone())
    }

    /// Network deposits of `kind` arrive on
    pub fn deposit_network(&self, kind: RequestKind) -> &Network {
        match kind {
            RequestKind::Wrap => &self.native,
            RequestKind::Unwrap => &self.wrapped,
        }
    }

    /// Network deposits of `kind` are paid out on
    pub fn payout_network(&self, kind: RequestKind) -> &Network {
        match kind {
            RequestKind::Wrap => &self.wrapped,
            RequestKind::Unwrap => &self.native,
        }
    }

    pub fn rate_source(&self) -> Result<RateSource> {
        match self.config.bridge.mode {
            BridgeMode::Wrapped => Ok(RateSource::Reserves),
            BridgeMode::Swap => self
                .config
                .bridge
                .native_to_native_multiplier
                .clone()
                .map(RateSource::Fixed)
                .ok_or_else(|| eyre!("swap mode requires a native-to-native multiplier")),
        }
    }

    pub fn conversion_engine(&self, kind: RequestKind) -> Result<ConversionRateEngine> {
        Ok(ConversionRateEngine::new(
            kind,
            self.rate_source()?,
            self.balances(),
            self.requests(RequestKind::Wrap),
            self.requests(RequestKind::Unwrap),
            self.timestamps(&self.native),
            self.timestamps(&self.wrapped),
            self.native.connector.clone(),
        ))
    }

    /// Ingestion of `kind` deposits, reaching the deposit chain through `scanner`
    fn transfer_processor(&self, kind: RequestKind, scanner: &ChainScanner) -> TransferRequestProcessor {
        let deposit = scanned(self.deposit_network(kind), scanner);
        TransferRequestProcessor::new(
            deposit.clone(),
            self.payout_network(kind).connector.clone(),
            self.requests(kind),
            self.timestamps(&deposit),
            self.metrics.clone(),
        )
    }

    fn dispatcher(&self, kind: RequestKind) -> Result<PayoutDispatcher> {
        let payout = PayoutNetwork::select(
            self.config.bridge.mode,
            kind,
            self.payout_network(kind).clone(),
        );
        let dispatcher = PayoutDispatcher::new(
            self.requests(kind),
            self.conversion_engine(kind)?,
            payout,
            self.config.fee_settings(),
            self.config.timeout_settings(),
            self.metrics.clone(),
        );
        Ok(match &self.oracle {
            Some(oracle) => dispatcher.with_oracle(oracle.clone()),
            None => dispatcher,
        })
    }

    fn reconciler(&self, kind: RequestKind) -> FinalizationReconciler {
        let payout = self.payout_network(kind);
        FinalizationReconciler::new(
            self.requests(kind),
            payout.connector.clone(),
            self.timestamps(payout),
            self.timestamps(self.deposit_network(kind)),
            self.config.operator.request_lifetime_hours,
            self.metrics.clone(),
        )
    }
}

/// `network` with its node calls going through `scanner`'s limits
fn scanned(network: &Network, scanner: &ChainScanner) -> Network {
    Network {
        connector: scanner.connector(),
        ..network.clone()
    }
}

fn network(config: &NetworkConfig, connector: Arc<dyn ChainConnector>) -> Network {
    Network {
        name: config.name.clone(),
        connector,
        bridge_address: config.bridge_address.clone(),
        asset: config.asset.clone(),
        asset_ticker: config.asset_ticker.clone(),
        fee_ticker: config.fee_ticker.clone(),
    }
}

/// Everything one workflow cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: Vec<(String, Range<u64>)>,
    pub wrap_payouts: DispatchSummary,
    pub unwrap_payouts: DispatchSummary,
    pub wrap_reconciled: ReconcileSummary,
    pub unwrap_reconciled: ReconcileSummary,
    /// Steps that failed; the other steps still ran
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn record<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(step, error = ?e, "Workflow step failed");
                self.errors.push(format!("{}: {:#}", step, e));
                None
            }
        }
    }
}

/// Drives all workflows of a bridge
pub struct WorkflowManager {
    mode: BridgeMode,
    balance_scanner: ChainScanner,
    wrap_scanner: ChainScanner,
    unwrap_scanner: ChainScanner,
    balance_processor: BalanceChangeProcessor,
    wrap_processor: TransferRequestProcessor,
    unwrap_processor: TransferRequestProcessor,
    wrap_dispatcher: PayoutDispatcher,
    unwrap_dispatcher: PayoutDispatcher,
    wrap_reconciler: FinalizationReconciler,
    unwrap_reconciler: FinalizationReconciler,
    wrap_engine: ConversionRateEngine,
    unwrap_engine: ConversionRateEngine,
    metrics: Metrics,
    poll_interval: Duration,
    failure_backoff: RetryConfig,
    consecutive_failures: u32,
}

impl WorkflowManager {
    pub fn new(context: &BridgeContext) -> Result<Self> {
        let config = &context.config;
        let scanner = |network: &Network, settings| {
            ChainScanner::new(
                network.name.clone(),
                network.connector.clone(),
                settings,
                context.metrics.clone(),
            )
        };
        // one scanner per ledger
        let balance_scanner = scanner(&context.native, config.scanner_settings(&config.native))?;
        let wrap_scanner = scanner(&context.native, config.scanner_settings(&config.native))?;
        let unwrap_scanner = scanner(&context.wrapped, config.scanner_settings(&config.wrapped))?;

        Ok(Self {
            mode: config.bridge.mode,
            balance_processor: BalanceChangeProcessor::new(
                scanned(&context.native, &balance_scanner),
                context.balances(),
            ),
            wrap_processor: context.transfer_processor(RequestKind::Wrap, &wrap_scanner),
            unwrap_processor: context.transfer_processor(RequestKind::Unwrap, &unwrap_scanner),
            balance_scanner,
            wrap_scanner,
            unwrap_scanner,
            wrap_dispatcher: context.dispatcher(RequestKind::Wrap)?,
            unwrap_dispatcher: context.dispatcher(RequestKind::Unwrap)?,
            wrap_reconciler: context.reconciler(RequestKind::Wrap),
            unwrap_reconciler: context.reconciler(RequestKind::Unwrap),
            wrap_engine: context.conversion_engine(RequestKind::Wrap)?,
            unwrap_engine: context.conversion_engine(RequestKind::Unwrap)?,
            metrics: context.metrics.clone(),
            poll_interval: config.poll_interval(),
            failure_backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_backoff: config.poll_interval(),
                max_backoff: MAX_FAILURE_BACKOFF.max(config.poll_interval()),
                backoff_multiplier: 2.0,
            },
            consecutive_failures: 0,
        })
    }

    async fn scan(
        scanner: &ChainScanner,
        processor: &dyn HeightProcessor,
    ) -> (String, Result<Option<Range<u64>>>) {
        (
            processor.ledger_name().to_string(),
            scanner.scan(processor).await,
        )
    }

    /// One pass of scan → dispatch → reconcile
    ///
    /// Scans run concurrently. Payouts only see data the scans have committed, so a
    /// failed scan never blocks dispatch of requests that are already priced.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let (balances, wraps, unwraps) = tokio::join!(
            async {
                match self.mode {
                    // a fixed multiplier needs no balance index
                    BridgeMode::Swap => None,
                    BridgeMode::Wrapped => {
                        Some(Self::scan(&self.balance_scanner, &self.balance_processor).await)
                    }
                }
            },
            Self::scan(&self.wrap_scanner, &self.wrap_processor),
            Self::scan(&self.unwrap_scanner, &self.unwrap_processor),
        );
        for (ledger, result) in [balances, Some(wraps), Some(unwraps)].into_iter().flatten() {
            if let Some(Some(range)) = report.record(&format!("scan {}", ledger), result) {
                report.scanned.push((ledger, range));
            }
        }

        if let Some(summary) = report.record("dispatch wrap", self.wrap_dispatcher.dispatch().await) {
            report.wrap_payouts = summary;
        }
        if let Some(summary) = report.record("dispatch unwrap", self.unwrap_dispatcher.dispatch().await) {
            report.unwrap_payouts = summary;
        }
        if let Some(summary) = report.record("reconcile wrap", self.wrap_reconciler.reconcile().await) {
            report.wrap_reconciled = summary;
        }
        if let Some(summary) = report.record("reconcile unwrap", self.unwrap_reconciler.reconcile().await) {
            report.unwrap_reconciled = summary;
        }

        report
    }

    /// Log and export the best available rate of both directions
    pub async fn heartbeat(&self, cycle: u64) {
        for (kind, engine) in [
            (RequestKind::Wrap, &self.wrap_engine),
            (RequestKind::Unwrap, &self.unwrap_engine),
        ] {
            match engine.create_best_calculator().await {
                Ok(calculator) => {
                    let rate = calculator.rate();
                    self.metrics
                        .conversion_rate
                        .with_label_values(&[kind.as_str()])
                        .set(rate.to_f64().unwrap_or(0.0));
                    info!(
                        cycle,
                        kind = %kind,
                        ready = calculator.is_ready(),
                        rate = %rate,
                        native_balance = calculator.native_balance(),
                        wrapped_balance = calculator.wrapped_balance(),
                        unwrapped_balance = calculator.unwrapped_balance(),
                        consecutive_failures = self.consecutive_failures,
                        "Bridge heartbeat"
                    );
                }
                Err(e) => warn!(cycle, kind = %kind, error = %e, "Heartbeat could not compute rate"),
            }
        }
    }

    /// Run cycles until a shutdown message arrives or the sender is dropped
    ///
    /// Shutdown is only observed between cycles, so an announced payout is always
    /// recorded before the loop returns.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut cycle_count = 0u64;

        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            mode = ?self.mode,
            "Workflow manager starting poll loop"
        );

        loop {
            cycle_count += 1;

            if cycle_count % HEARTBEAT_CYCLES == 1 {
                self.heartbeat(cycle_count).await;
            }

            // a cycle is never cancelled part way; shutdown is picked up once it ends
            let started = Instant::now();
            let report = self.run_cycle().await;
            self.metrics
                .cycle_duration
                .with_label_values(&[if report.is_ok() { "ok" } else { "error" }])
                .observe(started.elapsed().as_secs_f64());

            let pause = if report.is_ok() {
                self.consecutive_failures = 0;
                self.poll_interval
            } else {
                self.consecutive_failures += 1;
                let backoff = self
                    .failure_backoff
                    .backoff_for_retry(self.consecutive_failures - 1);
                warn!(
                    cycle = cycle_count,
                    consecutive_failures = self.consecutive_failures,
                    next_backoff_secs = backoff.as_secs(),
                    errors = ?report.errors,
                    "Workflow cycle had failures, backing off"
                );
                backoff
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping workflows");
                    return Ok(());
                }
            }
        }
    }
}
