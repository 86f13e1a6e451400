//! Metric instrument factories for simrun.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("simrun")
}

/// Counter: submissions.
/// Labels: `result` ("scheduled" | "in_flight" | "completed" | "rejected").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("simrun.jobs.submitted")
        .with_description("Number of simulation submissions")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("simrun.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Histogram: wall time of `Worker::run` in milliseconds.
/// Labels: `state` (terminal state).
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("simrun.jobs.duration_ms")
        .with_description("Worker run duration in milliseconds")
        .with_unit("ms")
        .build()
}
