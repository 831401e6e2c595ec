//! Prometheus metrics exposition
//!
//! - `oauth_initiations_total` (counter)
//! - `oauth_callbacks_total` (counter): label `outcome`
//! - `oauth_token_exchange_duration_seconds` (histogram): label `outcome`
//! - `oauth_token_refresh_total` (counter): label `result`, recorded by
//!   `meli_tokens`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const EXCHANGE_DURATION: &str = "oauth_token_exchange_duration_seconds";

/// Bucket boundaries from 5ms up to just past the token endpoint timeout
/// ceiling.
const EXCHANGE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(EXCHANGE_DURATION.to_string()), EXCHANGE_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The exchange duration renders as a Prometheus histogram (`_bucket` lines)
/// rather than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one authorization attempt started.
pub fn record_initiation() {
    metrics::counter!("oauth_initiations_total").increment(1);
}

/// Record a finished callback. `outcome` is `success` or a failure reason.
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("oauth_callbacks_total", "outcome" => outcome).increment(1);
}

/// Record how long a callback that reached the token endpoint took.
pub fn record_exchange_duration(outcome: &'static str, duration_secs: f64) {
    metrics::histogram!(EXCHANGE_DURATION, "outcome" => outcome).record(duration_secs);
}
