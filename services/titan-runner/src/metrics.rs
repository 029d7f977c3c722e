//! Prometheus metrics exposition
//!
//! Runner-level series. The stream and jobs crates emit their own
//! (`titan_stream_*`, `titan_jobs_*`) through the same global recorder.
//!
//! - `titan_account_failures_total` (counter): label `reason`
//! - `titan_bootstrap_duration_seconds` (histogram): label `outcome`
//! - `titan_points_total` (gauge): label `account`
//! - `titan_accounts_launched_total` (counter)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const BOOTSTRAP_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("titan_bootstrap_duration_seconds".to_string()),
            BOOTSTRAP_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must run before any account task starts so no early series are lost.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record an account pipeline that ended in failure.
pub fn record_account_failure(reason: &'static str) {
    metrics::counter!("titan_account_failures_total", "reason" => reason).increment(1);
}

/// Record how long a bootstrap took and whether it succeeded.
pub fn record_bootstrap(outcome: &'static str, duration_secs: f64) {
    metrics::histogram!("titan_bootstrap_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

pub fn set_points(account: &str, total: f64) {
    metrics::gauge!("titan_points_total", "account" => account.to_string()).set(total);
}

pub fn record_launch() {
    metrics::counter!("titan_accounts_launched_total").increment(1);
}
