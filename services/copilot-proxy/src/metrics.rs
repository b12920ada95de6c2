//! Prometheus metrics exposition
//!
//! Metrics recorded by this binary:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_dispatch_attempts_total` (counter): label `outcome`
//! - `proxy_quota_report_failures_total` (counter): reported quota that could
//!   not be recorded
//!
//! The pool crate adds `copilot_pool_rotations_total`,
//! `copilot_pool_exhausted_total` and `copilot_pool_reclaimed_total`.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms up to the 120s default upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram (`_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record one upstream attempt made by the dispatcher.
pub fn record_attempt(outcome: &'static str) {
    metrics::counter!("proxy_dispatch_attempts_total", "outcome" => outcome).increment(1);
}

/// Record quota from a response that the pool failed to store.
pub fn record_quota_report_failure() {
    metrics::counter!("proxy_quota_report_failures_total").increment(1);
}
