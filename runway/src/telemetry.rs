//! Tracing and telemetry instrumentation for runway.
//!
//! Span helpers for each stage of the provisioning chain, plus `record_*`
//! helpers that always log and additionally update Prometheus metrics when
//! the `metrics` feature is enabled.
//!
//! # Example
//!
//! ```ignore
//! use runway::telemetry::{dispatch_span, record_dispatch};
//!
//! let span = dispatch_span(&ctx.run_id, &ctx.run_key);
//! // ... invoke the backend inside the span
//! record_dispatch(&ctx.run_key, "sent");
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{Instrument, Span, info_span};

/// Span covering a whole run.
#[must_use]
pub fn run_span(run_id: impl Display, run_key: impl Display) -> Span {
    info_span!("runway.run", run_id = %run_id, run_key = %run_key)
}

/// Span for identity brokering.
#[must_use]
pub fn identity_span(run_id: impl Display) -> Span {
    info_span!("runway.identity", run_id = %run_id)
}

/// Span for the registry login.
#[must_use]
pub fn registry_span(run_id: impl Display) -> Span {
    info_span!("runway.registry", run_id = %run_id)
}

/// Span for the backend invocation.
///
/// Carries the runner count and compute tier, never the token.
#[must_use]
pub fn dispatch_span(run_id: impl Display, runner_count: u32, compute_tier: impl Display) -> Span {
    info_span!(
        "runway.dispatch",
        run_id = %run_id,
        runner_count = runner_count,
        compute_tier = %compute_tier,
    )
}

/// Span for response validation.
#[must_use]
pub fn validate_span(run_id: impl Display) -> Span {
    info_span!("runway.validate", run_id = %run_id)
}

/// Span for the consumer job.
#[must_use]
pub fn consumer_span(run_id: impl Display) -> Span {
    info_span!("runway.consumer", run_id = %run_id)
}

/// Instrument a future with the dispatch span.
pub fn instrument_dispatch<F>(
    run_id: impl Display,
    runner_count: u32,
    compute_tier: impl Display,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(run_id, runner_count, compute_tier))
}

/// Record a triggered run.
pub fn record_run_started(run_key: impl Display) {
    tracing::info!(run_key = %run_key, "run started");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_started();
}

/// Record a run's terminal outcome (`confirmed`, `completed`, `failed`,
/// `superseded`).
pub fn record_run_finished(run_key: impl Display, outcome: &str) {
    if outcome == "failed" {
        tracing::warn!(run_key = %run_key, outcome, "run finished");
    } else {
        tracing::info!(run_key = %run_key, outcome, "run finished");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(outcome);
}

/// Record a dispatch attempt by status (`sent`, `transport_error`,
/// `timeout`).
pub fn record_dispatch(run_key: impl Display, status: &str) {
    tracing::debug!(run_key = %run_key, status, "dispatch recorded");

    #[cfg(feature = "metrics")]
    crate::metrics::record_dispatch(status);
}

/// Observe how long a stage took.
pub fn observe_stage_duration(stage: &str, duration: Duration) {
    let duration_secs = duration.as_secs_f64();
    tracing::debug!(stage, duration_secs, "stage duration observed");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_stage_duration(stage, duration_secs);
}

/// Start timing a stage. Pass the handle to [`StageTimer::finish`].
pub fn start_stage(stage: &'static str) -> StageTimer {
    StageTimer {
        stage,
        start: Instant::now(),
    }
}

/// Handle for tracking how long one stage of a run took.
#[derive(Debug)]
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    #[must_use]
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) {
        observe_stage_duration(self.stage, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names() {
        let cases = [
            (run_span("r", "ci-main"), "runway.run"),
            (identity_span("r"), "runway.identity"),
            (registry_span("r"), "runway.registry"),
            (dispatch_span("r", 1, "S"), "runway.dispatch"),
            (validate_span("r"), "runway.validate"),
            (consumer_span("r"), "runway.consumer"),
        ];
        for (span, name) in cases {
            // spans are disabled without a subscriber
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), name);
            }
        }
    }

    #[test]
    fn stage_timer_reports_elapsed() {
        let timer = start_stage("dispatch");
        assert_eq!(timer.stage(), "dispatch");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() >= Duration::from_millis(1));
        timer.finish();
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_run_started("ci-main");
        record_dispatch("ci-main", "sent");
        record_run_finished("ci-main", "failed");
        record_run_finished("ci-main", "confirmed");
    }
}
