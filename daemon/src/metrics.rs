/// Metrics collection and exposure

use crate::errors::{DaemonError, DaemonResult};
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Request metrics
    pub request_total: Counter,
    pub request_duration: Histogram,
    pub request_errors: Counter,

    // Workflow metrics
    pub instances_started: IntCounter,
    pub cancellations_requested: IntCounter,
    pub gate_mutations: IntCounter,

    // Connection metrics
    pub connections_active: IntGauge,

    pub server_start: Instant,
}

fn register<M>(registry: &Registry, metric: M) -> DaemonResult<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    Ok(metric)
}

fn metric_err(e: prometheus::Error) -> DaemonError {
    DaemonError::MetricsError(e.to_string())
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> DaemonResult<Self> {
        let registry = Arc::new(Registry::new());

        let request_total = register(
            &registry,
            Counter::new("taskpack_requests_total", "Total requests").map_err(metric_err)?,
        )?;
        let request_duration = register(
            &registry,
            Histogram::with_opts(HistogramOpts::new(
                "taskpack_request_duration_seconds",
                "Request duration",
            ))
            .map_err(metric_err)?,
        )?;
        let request_errors = register(
            &registry,
            Counter::new("taskpack_request_errors_total", "Total request errors")
                .map_err(metric_err)?,
        )?;
        let instances_started = register(
            &registry,
            IntCounter::new("taskpack_instances_started_total", "Workflow instances started")
                .map_err(metric_err)?,
        )?;
        let cancellations_requested = register(
            &registry,
            IntCounter::new(
                "taskpack_cancellations_requested_total",
                "Cancel requests accepted",
            )
            .map_err(metric_err)?,
        )?;
        let gate_mutations = register(
            &registry,
            IntCounter::new("taskpack_gate_mutations_total", "Gate rows written")
                .map_err(metric_err)?,
        )?;
        let connections_active = register(
            &registry,
            IntGauge::new("taskpack_connections_active", "Requests in flight")
                .map_err(metric_err)?,
        )?;

        Ok(MetricsCollector {
            registry,
            request_total,
            request_duration,
            request_errors,
            instances_started,
            cancellations_requested,
            gate_mutations,
            connections_active,
            server_start: Instant::now(),
        })
    }

    /// Record a request
    pub fn record_request(&self, duration_secs: f64) {
        self.request_total.inc();
        self.request_duration.observe(duration_secs);
    }

    /// Record a request error
    pub fn record_error(&self) {
        self.request_errors.inc();
    }

    pub fn record_start(&self) {
        self.instances_started.inc();
    }

    pub fn record_cancel(&self) {
        self.cancellations_requested.inc();
    }

    pub fn record_gate_mutations(&self, count: u64) {
        self.gate_mutations.inc_by(count);
    }

    /// Record new connection
    pub fn record_connection(&self) {
        self.connections_active.inc();
    }

    /// Record connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn uptime_secs(&self) -> u64 {
        self.server_start.elapsed().as_secs()
    }

    /// Get all metrics in Prometheus format
    pub fn gather_metrics(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_err)?;
        String::from_utf8(buffer).map_err(|e| DaemonError::MetricsError(e.to_string()))
    }

    /// Get the registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsCollector::new().unwrap();
        assert!(metrics.gather_metrics().is_ok());
    }

    #[test]
    fn test_request_recording() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request(0.5);
        metrics.record_error();
        assert_eq!(metrics.request_total.get(), 1.0);
        assert_eq!(metrics.request_errors.get(), 1.0);
    }

    #[test]
    fn test_workflow_counters_exposed() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_start();
        metrics.record_cancel();
        metrics.record_gate_mutations(2);
        assert_eq!(metrics.gate_mutations.get(), 2);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("taskpack_instances_started_total 1"));
        assert!(text.contains("taskpack_cancellations_requested_total 1"));
    }
}
