//! Metrics and monitoring using Prometheus.
//!
//! The runtime records publish, delivery and acknowledgment activity. The
//! push listener exposes the text format on `GET /metrics`; pull-only
//! processes can call [`Metrics::gather`] themselves.
//!
//! - **Counters**: messages published, received, acked, nacked; ack and pull errors; push requests
//! - **Histograms**: handler duration per subscription

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

/// Metrics collector for the runtime
pub struct Metrics {
    /// Messages accepted by publish calls (counter)
    pub messages_published_total: IntCounterVec,
    /// Messages delivered to this process (counter)
    pub messages_received_total: IntCounterVec,
    /// Deliveries acknowledged (counter)
    pub messages_acked_total: IntCounterVec,
    /// Deliveries released back to the service (counter)
    pub messages_nacked_total: IntCounterVec,
    /// Ack or nack RPCs that failed (counter)
    pub ack_errors_total: IntCounterVec,
    /// Pull RPC failures by failure code (counter)
    pub pull_errors_total: IntCounterVec,
    /// Push requests by response status (counter)
    pub push_requests_total: IntCounterVec,

    /// Handler execution time in seconds (histogram)
    pub handler_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        let messages_published_total = IntCounterVec::new(
            Opts::new("pubsub_messages_published_total", "Total messages published"),
            &["topic"],
        )
        .expect("Failed to create messages_published_total metric");

        let messages_received_total = IntCounterVec::new(
            Opts::new("pubsub_messages_received_total", "Total messages received"),
            &["subscription"],
        )
        .expect("Failed to create messages_received_total metric");

        let messages_acked_total = IntCounterVec::new(
            Opts::new("pubsub_messages_acked_total", "Total deliveries acknowledged"),
            &["subscription"],
        )
        .expect("Failed to create messages_acked_total metric");

        let messages_nacked_total = IntCounterVec::new(
            Opts::new("pubsub_messages_nacked_total", "Total deliveries released"),
            &["subscription"],
        )
        .expect("Failed to create messages_nacked_total metric");

        let ack_errors_total = IntCounterVec::new(
            Opts::new("pubsub_ack_errors_total", "Total failed ack/nack RPCs"),
            &["subscription", "operation"],
        )
        .expect("Failed to create ack_errors_total metric");

        let pull_errors_total = IntCounterVec::new(
            Opts::new("pubsub_pull_errors_total", "Total failed pull RPCs"),
            &["subscription", "code"],
        )
        .expect("Failed to create pull_errors_total metric");

        let push_requests_total = IntCounterVec::new(
            Opts::new("pubsub_push_requests_total", "Total push requests handled"),
            &["status"],
        )
        .expect("Failed to create push_requests_total metric");

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pubsub_handler_duration_seconds",
                "Handler execution time in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["subscription"],
        )
        .expect("Failed to create handler_duration_seconds metric");

        Self {
            messages_published_total,
            messages_received_total,
            messages_acked_total,
            messages_nacked_total,
            ack_errors_total,
            pull_errors_total,
            push_requests_total,
            handler_duration_seconds,
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_published_total.clone()))?;
        registry.register(Box::new(self.messages_received_total.clone()))?;
        registry.register(Box::new(self.messages_acked_total.clone()))?;
        registry.register(Box::new(self.messages_nacked_total.clone()))?;
        registry.register(Box::new(self.ack_errors_total.clone()))?;
        registry.register(Box::new(self.pull_errors_total.clone()))?;
        registry.register(Box::new(self.push_requests_total.clone()))?;
        registry.register(Box::new(self.handler_duration_seconds.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> Arc<Metrics> {
    METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_metrics_lazy_initialization() {
        let metrics1 = get_metrics();
        let metrics2 = get_metrics();
        assert!(Arc::ptr_eq(&metrics1, &metrics2));
    }

    #[test]
    fn test_metrics_gather() {
        let metrics = get_metrics();
        metrics
            .messages_published_total
            .with_label_values(&["metrics-test-topic"])
            .inc_by(2);
        metrics
            .handler_duration_seconds
            .with_label_values(&["metrics-test-sub"])
            .observe(0.02);

        let output = metrics.gather().expect("Failed to gather metrics");
        assert!(output.contains("pubsub_messages_published_total"));
        assert!(output.contains("metrics-test-topic"));
        assert!(output.contains("pubsub_handler_duration_seconds"));
    }

    #[test]
    fn test_pull_errors_labelled_by_code() {
        let metrics = get_metrics();
        metrics
            .pull_errors_total
            .with_label_values(&["metrics-test-pull", "unavailable"])
            .inc();

        let output = metrics.gather().expect("Failed to gather metrics");
        assert!(output.contains(
            "pubsub_pull_errors_total{code=\"unavailable\",subscription=\"metrics-test-pull\"}"
        ));
    }
}
