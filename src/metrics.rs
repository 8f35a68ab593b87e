//! Metrics
//! Mission: expose Prometheus counters/histograms for the comparison flow
//! via the `metrics` + `metrics-exporter-prometheus` crates.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus recorder")
}

pub fn record_compare_request(source: &str) {
    metrics::counter!("compare_requests_total", "source" => source.to_string()).increment(1);
}

pub fn record_compare_latency(seconds: f64) {
    metrics::histogram!("compare_request_duration_seconds").record(seconds);
}

pub fn record_cache_resolution(source: &str) {
    metrics::counter!("cache_resolutions_total", "source" => source.to_string()).increment(1);
}

pub fn record_credit_consume(success: bool) {
    metrics::counter!("credit_consume_total", "success" => success.to_string()).increment(1);
}

pub fn record_rate_limited() {
    metrics::counter!("rate_limited_total").increment(1);
}
