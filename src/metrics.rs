//! Prometheus metrics for the bridge operator
//!
//! Metrics live in their own [`Registry`] owned by the bridge context, so several
//! bridges (or tests) in one process never share counters.

use eyre::{Result, WrapErr};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Heights successfully processed, by ledger
    pub heights_scanned: IntCounterVec,
    /// Persisted watermark, by ledger
    pub watermark: IntGaugeVec,
    /// Scans abandoned without advancing the watermark, by ledger
    pub scan_failures: IntCounterVec,
    /// New requests ingested, by kind
    pub requests_ingested: IntCounterVec,
    /// Deposits rejected during ingestion, by kind
    pub request_errors: IntCounterVec,
    /// Payout attempts, by kind and outcome (sent, failed, skipped)
    pub payouts: IntCounterVec,
    /// Gross amount paid out, by kind
    pub payout_volume: CounterVec,
    /// Payouts confirmed final, by kind
    pub completions: IntCounterVec,
    /// Requests failed by expiry, by kind
    pub expirations: IntCounterVec,
    /// Latest best conversion rate, by kind
    pub conversion_rate: GaugeVec,
    /// Duration of a full workflow cycle
    pub cycle_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("bridge".to_string()), None)
            .wrap_err("Failed to create metrics registry")?;

        let heights_scanned = IntCounterVec::new(
            Opts::new("heights_scanned_total", "Total number of heights processed"),
            &["ledger"],
        )?;
        let watermark = IntGaugeVec::new(
            Opts::new("watermark_height", "Highest height fully processed"),
            &["ledger"],
        )?;
        let scan_failures = IntCounterVec::new(
            Opts::new("scan_failures_total", "Scans abandoned after a height failed"),
            &["ledger"],
        )?;
        let requests_ingested = IntCounterVec::new(
            Opts::new("requests_ingested_total", "Transfer requests detected"),
            &["kind"],
        )?;
        let request_errors = IntCounterVec::new(
            Opts::new("request_errors_total", "Deposits that could not become requests"),
            &["kind"],
        )?;
        let payouts = IntCounterVec::new(
            Opts::new("payouts_total", "Payout attempts by outcome"),
            &["kind", "outcome"],
        )?;
        let payout_volume = CounterVec::new(
            Opts::new("payout_volume_total", "Gross amount paid out"),
            &["kind"],
        )?;
        let completions = IntCounterVec::new(
            Opts::new("payouts_completed_total", "Payouts observed as finalized"),
            &["kind"],
        )?;
        let expirations = IntCounterVec::new(
            Opts::new("requests_expired_total", "Requests failed after their lifetime"),
            &["kind"],
        )?;
        let conversion_rate = GaugeVec::new(
            Opts::new("conversion_rate", "Best available conversion rate"),
            &["kind"],
        )?;
        let cycle_duration = HistogramVec::new(
            HistogramOpts::new("cycle_duration_seconds", "Duration of a workflow cycle")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["result"],
        )?;

        registry.register(Box::new(heights_scanned.clone()))?;
        registry.register(Box::new(watermark.clone()))?;
        registry.register(Box::new(scan_failures.clone()))?;
        registry.register(Box::new(requests_ingested.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(payouts.clone()))?;
        registry.register(Box::new(payout_volume.clone()))?;
        registry.register(Box::new(completions.clone()))?;
        registry.register(Box::new(expirations.clone()))?;
        registry.register(Box::new(conversion_rate.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            registry,
            heights_scanned,
            watermark,
            scan_failures,
            requests_ingested,
            request_errors,
            payouts,
            payout_volume,
            completions,
            expirations,
            conversion_rate,
            cycle_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .wrap_err("Failed to encode metrics")?;
        String::from_utf8(buffer).wrap_err("Metrics output is not UTF-8")
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
