//! Prometheus metrics for runway.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `runway_runs_started_total` - Runs triggered
//! - `runway_runs_finished_total` - Runs that reached a terminal outcome
//! - `runway_dispatch_total` - Backend invocations by status
//!
//! ## Histograms
//! - `runway_stage_duration_seconds` - Time spent in each chain stage
#![cfg(feature = "metrics")]

use prometheus::{Counter, CounterVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for runway metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RUNS_STARTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("runway_runs_started_total", "Total number of runs triggered")
        .expect("runway_runs_started_total metric creation failed")
});

/// Labels:
/// - `outcome`: confirmed, completed, failed or superseded
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runway_runs_finished_total",
        "Total number of runs that reached a terminal outcome",
    );
    CounterVec::new(opts, &["outcome"]).expect("runway_runs_finished_total metric creation failed")
});

/// Labels:
/// - `status`: sent, transport_error or timeout
pub static DISPATCH_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runway_dispatch_total",
        "Total number of provisioning backend invocations",
    );
    CounterVec::new(opts, &["status"]).expect("runway_dispatch_total metric creation failed")
});

/// Labels:
/// - `stage`: identity, registry, dispatch, validate or consumer
pub static STAGE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // 10ms up to roughly a day, consumer jobs are long
    let buckets = exponential_buckets(0.01, 4.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "runway_stage_duration_seconds",
        "Duration of each provisioning stage in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["stage"]).expect("runway_stage_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_STARTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(DISPATCH_TOTAL.clone()),
        Box::new(STAGE_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_run_started() {
    RUNS_STARTED_TOTAL.inc();
}

pub fn record_run_finished(outcome: &str) {
    RUNS_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_dispatch(status: &str) {
    DISPATCH_TOTAL.with_label_values(&[status]).inc();
}

pub fn observe_stage_duration(stage: &str, duration_secs: f64) {
    STAGE_DURATION_SECONDS
        .with_label_values(&[stage])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
