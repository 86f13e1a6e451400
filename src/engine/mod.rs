//! Execution engine: workers, jobs, cancellation and the local runner.

pub mod job;
pub mod runner;
pub mod signal;
pub mod worker;

pub use job::{JobHandle, JobId, JobState};
pub use runner::{LocalSimulationRunner, RunnerConfig, RunnerSummary, SubmitResult};
pub use signal::CancelSignal;
pub use worker::{CommandOutput, CommandWorker, Worker};
