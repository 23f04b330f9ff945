//! Observability: logging and metrics.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the observability stack.
pub fn init(log_level: &str, json_logging: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    metrics::register_metrics();

    Ok(())
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{
        counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    };

    /// Register all metric descriptions.
    pub fn register_metrics() {
        // Counters
        describe_counter!(
            "pulse_jobs_created_total",
            "Total number of jobs accepted for scheduling"
        );
        describe_counter!(
            "pulse_jobs_fired_total",
            "Total number of successful job executions"
        );
        describe_counter!(
            "pulse_jobs_retried_total",
            "Total number of execution attempts that entered retry"
        );
        describe_counter!(
            "pulse_jobs_failed_total",
            "Total number of jobs that reached terminal error"
        );
        describe_counter!(
            "pulse_jobs_canceled_total",
            "Total number of canceled jobs"
        );
        describe_counter!(
            "pulse_lease_acquisitions_total",
            "Total number of successful master lease claims"
        );
        describe_counter!(
            "pulse_lease_demotions_total",
            "Total number of times this replica lost mastership"
        );
        describe_counter!(
            "pulse_transition_conflicts_total",
            "Optimistic version conflicts observed while claiming due jobs"
        );

        // Gauges
        describe_gauge!(
            "pulse_is_master",
            "1 while this replica holds the master lease"
        );
        describe_gauge!(
            "pulse_dispatches_in_flight",
            "Number of dispatches currently executing"
        );

        // Histograms
        describe_histogram!(
            "pulse_dispatch_duration_seconds",
            "Recipient dispatch duration in seconds"
        );
    }

    /// Record a successful job execution.
    pub fn record_job_fired(duration_secs: f64) {
        counter!("pulse_jobs_fired_total").increment(1);
        histogram!("pulse_dispatch_duration_seconds").record(duration_secs);
    }

    /// Record an attempt entering retry.
    pub fn record_job_retried() {
        counter!("pulse_jobs_retried_total").increment(1);
    }

    /// Record a terminal job failure.
    pub fn record_job_failed() {
        counter!("pulse_jobs_failed_total").increment(1);
    }

    /// Update the mastership gauge.
    pub fn set_master(is_master: bool) {
        gauge!("pulse_is_master").set(if is_master { 1.0 } else { 0.0 });
    }

    /// Update the in-flight dispatch gauge.
    pub fn set_dispatches_in_flight(count: u64) {
        gauge!("pulse_dispatches_in_flight").set(count as f64);
    }
}
