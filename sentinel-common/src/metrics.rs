//! The fixed metric catalogue, backed by a private Prometheus registry.
//!
//! Every component receives a cloned handle to this struct rather than going
//! through a process-global; the registry stays owned here and is only
//! reachable through [`Metrics::render`].

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntGauge, Registry, TextEncoder,
};
use thiserror::Error;

/// Upper bounds (seconds) shared by all duration histograms.
pub const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration error: {}", _0)]
    Register(#[from] prometheus::Error),
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounter,
    pub requests_success: IntCounter,
    pub requests_error: IntCounter,
    pub queue_events_received_total: IntCounter,
    pub queue_events_processed_total: IntCounter,
    pub queue_events_failed_total: IntCounter,
    pub db_queries_total: IntCounter,
    pub worker_tasks_total: IntCounter,

    pub pool_open_connections: IntGauge,
    pub pool_busy_connections: IntGauge,
    pub queue_depth: IntGauge,
    pub worker_tasks_in_progress: IntGauge,
    pub http_requests_in_flight: IntGauge,

    pub http_request_duration: Histogram,
    pub db_query_duration: Histogram,
    pub worker_task_duration: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram, MetricsError> {
    let histogram =
        Histogram::with_opts(HistogramOpts::new(name, help).buckets(DURATION_BUCKETS.to_vec()))?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        Ok(Self {
            registry: registry.clone(),
            requests_total: counter(&registry, "requests_total", "HTTP requests received")?,
            requests_success: counter(
                &registry,
                "requests_success",
                "HTTP requests answered with a non-error status",
            )?,
            requests_error: counter(
                &registry,
                "requests_error",
                "HTTP requests answered with an error status",
            )?,
            queue_events_received_total: counter(
                &registry,
                "queue_events_received_total",
                "Events dequeued from the database queue",
            )?,
            queue_events_processed_total: counter(
                &registry,
                "queue_events_processed_total",
                "Dequeued events whose handler completed",
            )?,
            queue_events_failed_total: counter(
                &registry,
                "queue_events_failed_total",
                "Dequeued events whose handler failed",
            )?,
            db_queries_total: counter(&registry, "db_queries_total", "Database queries issued")?,
            worker_tasks_total: counter(
                &registry,
                "worker_tasks_total",
                "Tasks executed by the worker pool",
            )?,

            pool_open_connections: gauge(
                &registry,
                "pool_open_connections",
                "Sessions currently open in the pool",
            )?,
            pool_busy_connections: gauge(
                &registry,
                "pool_busy_connections",
                "Sessions currently checked out of the pool",
            )?,
            queue_depth: gauge(&registry, "queue_depth", "Tasks waiting in the task queue")?,
            worker_tasks_in_progress: gauge(
                &registry,
                "worker_tasks_in_progress",
                "Tasks currently executing on workers",
            )?,
            http_requests_in_flight: gauge(
                &registry,
                "http_requests_in_flight",
                "HTTP requests currently being handled",
            )?,

            http_request_duration: histogram(
                &registry,
                "http_request_duration",
                "HTTP request handling duration in seconds",
            )?,
            db_query_duration: histogram(
                &registry,
                "db_query_duration",
                "Database query duration in seconds",
            )?,
            worker_task_duration: histogram(
                &registry,
                "worker_task_duration",
                "Worker task execution duration in seconds",
            )?,
        })
    }

    /// Starts a timer that observes `db_query_duration` on drop and counts the query.
    pub fn db_query_timer(&self) -> HistogramTimer {
        self.db_queries_total.inc();
        self.db_query_duration.start_timer()
    }

    /// Renders the whole catalogue in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!("metrics encoding failed: {}", e);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_observation_updates_buckets_sum_and_count() {
        let metrics = Metrics::new().unwrap();
        // Both samples are exact in binary so the rendered sum is stable.
        metrics.http_request_duration.observe(0.03125);
        metrics.http_request_duration.observe(2.0);

        let rendered = metrics.render();
        // Buckets with le >= 0.03125 see the first sample; only le >= 2.5
        // (and +Inf) see both.
        assert!(rendered.contains("http_request_duration_bucket{le=\"0.025\"} 0"));
        assert!(rendered.contains("http_request_duration_bucket{le=\"0.05\"} 1"));
        assert!(rendered.contains("http_request_duration_bucket{le=\"2.5\"} 2"));
        assert!(rendered.contains("http_request_duration_bucket{le=\"+Inf\"} 2"));
        assert!(rendered.contains("http_request_duration_count 2"));
        assert!(rendered.contains("http_request_duration_sum 2.03125"));
    }

    #[test]
    fn exposition_carries_help_and_type_lines() {
        let metrics = Metrics::new().unwrap();
        metrics.requests_total.inc();

        let rendered = metrics.render();
        assert!(rendered.contains("# HELP requests_total"));
        assert!(rendered.contains("# TYPE requests_total counter"));
        assert!(rendered.contains("requests_total 1"));
        assert!(rendered.contains("# TYPE queue_depth gauge"));
        assert!(rendered.contains("# TYPE worker_task_duration histogram"));
    }

    #[test]
    fn counters_only_increase_and_gauges_settle() {
        let metrics = Metrics::new().unwrap();
        metrics.worker_tasks_total.inc();
        metrics.worker_tasks_total.inc();
        assert_eq!(metrics.worker_tasks_total.get(), 2);

        metrics.queue_depth.set(7);
        metrics.queue_depth.set(3);
        assert_eq!(metrics.queue_depth.get(), 3);
    }
}
