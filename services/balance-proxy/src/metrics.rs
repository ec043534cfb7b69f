//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here:
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`, a unified error code
//! - `dispatch_attempts` (histogram): upstream calls per request
//! - `pool_key_cooldowns_total` (counter): labels `provider`, `escalated`; applied writes only
//!
//! The key-pool crate records `pool_keys_blocked_total` and
//! `pool_cache_reloads_total` through the same global recorder.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use provider::ErrorCode;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 30.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("proxy_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .and_then(|b| {
            b.set_buckets_for_metric(Matcher::Full("dispatch_attempts".to_string()), ATTEMPT_BUCKETS)
        })
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Histograms get explicit buckets so they render `_bucket` lines rather
/// than summaries.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream failure, labelled with its unified error code.
pub fn record_upstream_error(code: ErrorCode) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => code.as_str())
        .increment(1);
}

/// Record how many upstream calls one request took.
pub fn record_attempts(attempts: u32) {
    metrics::histogram!("dispatch_attempts").record(f64::from(attempts));
}

/// Record a cooldown that was written to the store.
pub fn record_cooldown(provider: &str, escalated: bool) {
    metrics::counter!(
        "pool_key_cooldowns_total",
        "provider" => provider.to_string(),
        "escalated" => escalated.to_string()
    )
    .increment(1);
}

/// In-process counters reported by the health endpoint.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently inside the proxy handler; reported when the drain
    /// deadline expires during shutdown.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_upstream_error(ErrorCode::NetworkError);
        record_attempts(3);
        record_cooldown("openai", false);
    }

    /// Isolated recorder so tests do not fight over the global one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(503, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("proxy_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"POST\""));
        assert!(
            output.contains("proxy_request_duration_seconds_bucket"),
            "duration must render as a histogram"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn dispatch_metrics_render_with_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_attempts(1);
        record_attempts(30);
        record_cooldown("google-ai-studio", true);
        record_upstream_error(ErrorCode::NetworkError);
        record_upstream_error(ErrorCode::ServiceUnavailable);

        let output = handle.render();
        assert!(output.contains("dispatch_attempts_bucket"));
        assert!(output.contains("le=\"30\""));
        assert!(output.contains("pool_key_cooldowns_total"));
        assert!(output.contains("provider=\"google-ai-studio\""));
        assert!(output.contains("escalated=\"true\""));
        assert!(output.contains("error_type=\"network_error\""));
        assert!(output.contains("error_type=\"service_unavailable\""));
    }

    #[test]
    fn service_metrics_start_at_zero() {
        use std::sync::atomic::Ordering;
        let m = ServiceMetrics::new();
        assert_eq!(m.requests_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.in_flight.load(Ordering::Relaxed), 0);
        let clone = m.clone();
        clone.errors_total.fetch_add(1, Ordering::Relaxed);
        assert_eq!(m.errors_total.load(Ordering::Relaxed), 1);
    }
}
