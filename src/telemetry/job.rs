//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the runner.

use tracing::Span;

use crate::engine::{JobId, JobState};
use crate::model::Identifier;

/// Start a span for one job's execution.
///
/// The `job.state` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_job_span(job_id: &JobId, identifier: &Identifier) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.identifier" = %identifier.short(),
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span and emit an `info` event
/// scoped to it.
pub fn record_state_transition(span: &Span, from: JobState, to: JobState) {
    span.record("job.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
}
