//! Prometheus metrics for proxied worker operations.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

/// Counters, histogram and gauge labelled per worker (and operation).
pub struct ControlMetrics {
    pub registry: Registry,
    proxy_success: IntCounterVec,
    proxy_error: IntCounterVec,
    proxy_duration: HistogramVec,
    active_websockets: IntGaugeVec,
}

impl ControlMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let proxy_success = IntCounterVec::new(
            Opts::new("proxy_success_total", "Successful proxied worker calls"),
            &["worker", "operation"],
        )
        .unwrap();
        let proxy_error = IntCounterVec::new(
            Opts::new("proxy_error_total", "Failed proxied worker calls"),
            &["worker", "operation"],
        )
        .unwrap();
        let proxy_duration = HistogramVec::new(
            HistogramOpts::new(
                "proxy_request_duration_seconds",
                "Latency of proxied worker calls",
            ),
            &["worker", "operation"],
        )
        .unwrap();
        let active_websockets = IntGaugeVec::new(
            Opts::new("active_websockets", "Open bridged WebSocket sessions"),
            &["worker"],
        )
        .unwrap();

        registry.register(Box::new(proxy_success.clone())).unwrap();
        registry.register(Box::new(proxy_error.clone())).unwrap();
        registry.register(Box::new(proxy_duration.clone())).unwrap();
        registry
            .register(Box::new(active_websockets.clone()))
            .unwrap();

        Self {
            registry,
            proxy_success,
            proxy_error,
            proxy_duration,
            active_websockets,
        }
    }

    pub fn record_success(&self, worker: &str, operation: &str, elapsed_seconds: f64) {
        self.proxy_success
            .with_label_values(&[worker, operation])
            .inc();
        self.proxy_duration
            .with_label_values(&[worker, operation])
            .observe(elapsed_seconds);
    }

    pub fn record_error(&self, worker: &str, operation: &str, elapsed_seconds: f64) {
        self.proxy_error
            .with_label_values(&[worker, operation])
            .inc();
        self.proxy_duration
            .with_label_values(&[worker, operation])
            .observe(elapsed_seconds);
    }

    pub fn websocket_opened(&self, worker: &str) {
        self.active_websockets.with_label_values(&[worker]).inc();
    }

    pub fn websocket_closed(&self, worker: &str) {
        self.active_websockets.with_label_values(&[worker]).dec();
    }
}

impl Default for ControlMetrics {
    fn default() -> Self {
        Self::new()
    }
}
