//! Local runner: deduplicates submissions, bounds concurrency, and folds
//! finished simulations into its project.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::job::{Job, JobHandle, JobOutcome, JobState};
use super::worker::Worker;
use crate::config::Config;
use crate::error::{Error, Result, WorkerError};
use crate::model::{Identifier, Options, Simulation};
use crate::project::Project;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;
use crate::token::{Token, TokenState};

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Configuration for a [`LocalSimulationRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of concurrent `Worker::run` calls. Must be at least 1.
    pub max_workers: usize,
    /// Parent of the default per-job output directories.
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let config = Config::default();
        Self::from(&config)
    }
}

impl From<&Config> for RunnerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.max_workers,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// What a submission turned into.
#[derive(Clone)]
pub enum SubmitResult<O> {
    /// New work was queued.
    Scheduled(JobHandle<O>),
    /// A content-equal job is already pending or running; this is its handle.
    InFlight(JobHandle<O>),
    /// The project already holds a content-equal simulation.
    Completed(Arc<Simulation<O>>),
}

impl<O: Options> SubmitResult<O> {
    /// The job handle, unless the simulation was already complete.
    pub fn handle(&self) -> Option<&JobHandle<O>> {
        match self {
            SubmitResult::Scheduled(handle) | SubmitResult::InFlight(handle) => Some(handle),
            SubmitResult::Completed(_) => None,
        }
    }

    /// True when no new work was scheduled.
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, SubmitResult::Scheduled(_))
    }

    pub fn identifier(&self) -> Identifier {
        match self {
            SubmitResult::Scheduled(handle) | SubmitResult::InFlight(handle) => handle.identifier(),
            SubmitResult::Completed(simulation) => simulation.identifier(),
        }
    }

    /// Wait for the simulation, whichever way the submission went.
    pub async fn result(&self) -> Result<Arc<Simulation<O>>> {
        match self {
            SubmitResult::Scheduled(handle) | SubmitResult::InFlight(handle) => {
                handle.result().await
            }
            SubmitResult::Completed(simulation) => Ok(Arc::clone(simulation)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SubmitResult::Scheduled(_) => "scheduled",
            SubmitResult::InFlight(_) => "in_flight",
            SubmitResult::Completed(_) => "completed",
        }
    }
}

impl<O: Options> std::fmt::Debug for SubmitResult<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitResult::Scheduled(handle) => f.debug_tuple("Scheduled").field(handle).finish(),
            SubmitResult::InFlight(handle) => f.debug_tuple("InFlight").field(handle).finish(),
            SubmitResult::Completed(simulation) => f
                .debug_tuple("Completed")
                .field(&simulation.identifier())
                .finish(),
        }
    }
}

/// Counters over every job the runner has scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerSummary {
    pub submitted: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Simulations held by the project.
    pub simulations: usize,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct RunnerState<O> {
    /// Every scheduled job, in submission order.
    jobs: Vec<Arc<Job<O>>>,
    /// Latest job per identifier. Entries may be terminal until the
    /// executing task removes them.
    in_flight: HashMap<Identifier, Arc<Job<O>>>,
    /// `None` once the runner stops accepting submissions.
    queue: Option<mpsc::UnboundedSender<Arc<Job<O>>>>,
}

struct RunnerMetrics {
    submitted: Counter<u64>,
    transitions: Counter<u64>,
    duration_ms: Histogram<f64>,
}

impl RunnerMetrics {
    fn new() -> Self {
        Self {
            submitted: metrics::jobs_submitted(),
            transitions: metrics::job_state_transitions(),
            duration_ms: metrics::job_duration_ms(),
        }
    }

    fn transition(&self, span: &Span, from: JobState, to: JobState) {
        record_state_transition(span, from, to);
        self.transitions.add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

struct Shared<W: Worker> {
    worker: W,
    project: Arc<Project<W::Options>>,
    token: Token,
    slots: Arc<Semaphore>,
    state: Mutex<RunnerState<W::Options>>,
    metrics: RunnerMetrics,
}

impl<W: Worker> Shared<W> {
    /// Drop `job` from the in-flight index unless a newer job replaced it.
    fn release(&self, job: &Arc<Job<W::Options>>) {
        let mut state = self.state.lock();
        let identifier = job.identifier();
        let current = state
            .in_flight
            .get(&identifier)
            .is_some_and(|entry| Arc::ptr_eq(entry, job));
        if current {
            state.in_flight.remove(&identifier);
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs simulations through a [`Worker`] on the current Tokio runtime.
///
/// Each runner owns one [`Project`] and one root [`Token`]. Submissions whose
/// options are already in the project, or already pending or running, do not
/// schedule new work. At most `max_workers` workers run at once and slots are
/// granted in submission order.
///
/// `shutdown().await` is the graceful exit: it waits for every job to finish.
/// Dropping the runner only cancels its jobs; running workers stop at their
/// next checkpoint on their own tasks, after the runner is gone.
pub struct LocalSimulationRunner<W: Worker> {
    shared: Arc<Shared<W>>,
    config: RunnerConfig,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Worker> LocalSimulationRunner<W> {
    /// Create a runner with an empty project.
    ///
    /// Must be called inside a Tokio runtime: the dispatcher task starts
    /// immediately.
    pub fn new(worker: W, config: RunnerConfig) -> Result<Self> {
        Self::with_project(worker, config, Project::new())
    }

    /// Create a runner that continues an existing project. Options already
    /// in it are never run again.
    pub fn with_project(
        worker: W,
        config: RunnerConfig,
        project: Project<W::Options>,
    ) -> Result<Self> {
        if config.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Config(format!("runner must be created inside a Tokio runtime: {e}"))
        })?;

        let (queue, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            worker,
            project: Arc::new(project),
            token: Token::new("Simulations"),
            slots: Arc::new(Semaphore::new(config.max_workers)),
            state: Mutex::new(RunnerState {
                jobs: Vec::new(),
                in_flight: HashMap::new(),
                queue: Some(queue),
            }),
            metrics: RunnerMetrics::new(),
        });
        let dispatcher = runtime.spawn(dispatch(Arc::clone(&shared), receiver));

        info!(
            max_workers = config.max_workers,
            output_dir = %config.output_dir.display(),
            "runner started"
        );
        Ok(Self {
            shared,
            config,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Submit one options value. The job's output directory defaults to
    /// `output_dir/<identifier prefix>`.
    pub fn submit(&self, options: W::Options) -> Result<SubmitResult<W::Options>> {
        self.schedule(Simulation::new(options), None)
    }

    /// Like [`submit`](Self::submit), with an explicit output directory for
    /// the job.
    pub fn submit_in(
        &self,
        options: W::Options,
        output_dir: impl Into<PathBuf>,
    ) -> Result<SubmitResult<W::Options>> {
        self.schedule(Simulation::new(options), Some(output_dir.into()))
    }

    /// Submit several options values in order. Duplicates within the batch
    /// resolve to the first occurrence.
    pub fn submit_all<I>(&self, options: I) -> Result<Vec<SubmitResult<W::Options>>>
    where
        I: IntoIterator<Item = W::Options>,
    {
        options.into_iter().map(|o| self.submit(o)).collect()
    }

    fn schedule(
        &self,
        simulation: Simulation<W::Options>,
        output_dir: Option<PathBuf>,
    ) -> Result<SubmitResult<W::Options>> {
        let identifier = simulation.identifier();
        let mut state = self.shared.state.lock();

        let Some(queue) = state.queue.clone() else {
            self.shared
                .metrics
                .submitted
                .add(1, &[KeyValue::new("result", "rejected")]);
            return Err(Error::Closed);
        };

        // In-flight before project: a finishing job enters the project
        // before it turns terminal.
        let duplicate = match state.in_flight.get(&identifier) {
            Some(job) if !job.state().is_terminal() => {
                Some(SubmitResult::InFlight(JobHandle::new(Arc::clone(job))))
            }
            _ => self.shared.project.get(&identifier).map(SubmitResult::Completed),
        };
        if let Some(result) = duplicate {
            debug!(identifier = %identifier.short(), kind = result.label(), "duplicate submission");
            self.shared
                .metrics
                .submitted
                .add(1, &[KeyValue::new("result", result.label())]);
            return Ok(result);
        }

        // The token joins the root tree only once the dispatcher has the job.
        let token = Token::detached(
            format!("Simulation #{}", state.jobs.len() + 1),
            Some("simulation"),
        );
        let output_dir =
            output_dir.unwrap_or_else(|| self.config.output_dir.join(identifier.short()));
        let job = Arc::new(Job::new(simulation, token, output_dir));

        if queue.send(Arc::clone(&job)).is_err() {
            error!(job_id = %job.id(), "dispatcher is gone, rejecting submission");
            return Err(Error::Closed);
        }
        self.shared.token.attach(job.token());
        state.jobs.push(Arc::clone(&job));
        state.in_flight.insert(identifier, Arc::clone(&job));
        drop(state);

        info!(
            job_id = %job.id(),
            identifier = %identifier.short(),
            output_dir = %job.output_dir().display(),
            "job scheduled"
        );
        let result = SubmitResult::Scheduled(JobHandle::new(job));
        self.shared
            .metrics
            .submitted
            .add(1, &[KeyValue::new("result", result.label())]);
        Ok(result)
    }

    /// Cancel every job. Pending jobs end immediately; running jobs are
    /// signalled and stop at their worker's next checkpoint.
    pub fn cancel(&self) {
        let jobs = self.shared.state.lock().jobs.clone();
        let active = jobs.iter().filter(|job| !job.state().is_terminal()).count();
        info!(active, "cancelling all jobs");
        for job in jobs {
            job.cancel();
        }
    }

    /// Wait until every job submitted so far is terminal. Submissions stay
    /// open.
    pub async fn wait(&self) {
        let jobs = self.shared.state.lock().jobs.clone();
        for job in jobs {
            // The outcome sender lives in the job itself, so this only
            // returns once the job is terminal.
            let _ = job.wait().await;
        }
    }

    /// Stop accepting submissions and wait until every job is terminal.
    /// Further `submit` calls return [`Error::Closed`].
    pub async fn shutdown(&self) -> Result<()> {
        let queue = self.shared.state.lock().queue.take();
        if queue.is_some() {
            info!("runner closed to new submissions");
        }
        drop(queue);

        self.wait().await;

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher
                .await
                .map_err(|e| Error::Other(format!("dispatcher task failed: {e}")))?;
        }

        let summary = self.summary();
        info!(
            done = summary.done,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "runner shut down"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().queue.is_none()
    }

    /// Shared handle to the runner's project.
    pub fn project(&self) -> Arc<Project<W::Options>> {
        Arc::clone(&self.shared.project)
    }

    /// Root token; every job's token is a direct child.
    pub fn token(&self) -> &Token {
        &self.shared.token
    }

    pub fn progress(&self) -> f64 {
        self.shared.token.progress()
    }

    pub fn state(&self) -> TokenState {
        self.shared.token.state()
    }

    pub fn status(&self) -> String {
        self.shared.token.status()
    }

    /// Handles to every scheduled job, in submission order.
    pub fn jobs(&self) -> Vec<JobHandle<W::Options>> {
        self.shared
            .state
            .lock()
            .jobs
            .iter()
            .map(|job| JobHandle::new(Arc::clone(job)))
            .collect()
    }

    fn count(&self, wanted: JobState) -> usize {
        self.shared
            .state
            .lock()
            .jobs
            .iter()
            .filter(|job| job.state() == wanted)
            .count()
    }

    pub fn submitted_count(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn pending_count(&self) -> usize {
        self.count(JobState::Pending)
    }

    pub fn running_count(&self) -> usize {
        self.count(JobState::Running)
    }

    pub fn done_count(&self) -> usize {
        self.count(JobState::Done)
    }

    pub fn failed_count(&self) -> usize {
        self.count(JobState::Error)
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(JobState::Cancelled)
    }

    /// All counters from one consistent snapshot of the job set.
    pub fn summary(&self) -> RunnerSummary {
        let mut summary = RunnerSummary::default();
        {
            let state = self.shared.state.lock();
            summary.submitted = state.jobs.len();
            for job in &state.jobs {
                match job.state() {
                    JobState::Pending => summary.pending += 1,
                    JobState::Running => summary.running += 1,
                    JobState::Done => summary.done += 1,
                    JobState::Error => summary.failed += 1,
                    JobState::Cancelled => summary.cancelled += 1,
                }
            }
        }
        summary.simulations = self.shared.project.len();
        summary
    }
}

impl<W: Worker> Drop for LocalSimulationRunner<W> {
    fn drop(&mut self) {
        let active: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.queue = None;
            state
                .jobs
                .iter()
                .filter(|job| !job.state().is_terminal())
                .cloned()
                .collect()
        };
        if !active.is_empty() {
            warn!(
                active = active.len(),
                "runner dropped without shutdown, cancelling jobs"
            );
            for job in active {
                job.cancel();
            }
        }
    }
}

impl<W: Worker> std::fmt::Debug for LocalSimulationRunner<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSimulationRunner")
            .field("config", &self.config)
            .field("summary", &self.summary())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatch and execution
// ---------------------------------------------------------------------------

/// Hands queued jobs to free slots in queue order. Returns once the queue
/// is closed and drained.
async fn dispatch<W: Worker>(
    shared: Arc<Shared<W>>,
    mut queue: mpsc::UnboundedReceiver<Arc<Job<W::Options>>>,
) {
    while let Some(job) = queue.recv().await {
        let permit = tokio::select! {
            biased;
            _ = job.cancel_signal().cancelled() => None,
            permit = Arc::clone(&shared.slots).acquire_owned() => permit.ok(),
        };

        let span = start_job_span(&job.id(), &job.identifier());
        let permit = match permit {
            Some(permit) if job.try_start() => permit,
            _ => {
                job.cancel();
                shared
                    .metrics
                    .transition(&span, JobState::Pending, JobState::Cancelled);
                shared.release(&job);
                continue;
            }
        };

        shared
            .metrics
            .transition(&span, JobState::Pending, JobState::Running);
        tokio::spawn(execute(Arc::clone(&shared), job, permit, span.clone()).instrument(span));
    }
    debug!("dispatcher finished");
}

async fn execute<W: Worker>(
    shared: Arc<Shared<W>>,
    job: Arc<Job<W::Options>>,
    _permit: OwnedSemaphorePermit,
    span: Span,
) {
    let started = Instant::now();
    let outcome = match job.take_simulation() {
        Some(simulation) => run_worker(&shared, &job, simulation).await,
        None => JobOutcome::Failed(Arc::new(WorkerError::Failed(
            "simulation already taken".to_string(),
        ))),
    };

    let to = outcome.state();
    if job.finish(outcome) {
        shared.metrics.transition(&span, JobState::Running, to);
    }
    shared.release(&job);

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    shared
        .metrics
        .duration_ms
        .record(elapsed_ms, &[KeyValue::new("state", to.to_string())]);
    info!(state = %to, elapsed_ms, "job finished");
}

/// Run the worker on its own task so a panic is reported as a failure of
/// this job only.
async fn run_worker<W: Worker>(
    shared: &Arc<Shared<W>>,
    job: &Arc<Job<W::Options>>,
    mut simulation: Simulation<W::Options>,
) -> JobOutcome<W::Options> {
    let worker_shared = Arc::clone(shared);
    let token = job.token().clone();
    let output_dir = job.output_dir().to_path_buf();
    let cancel = job.cancel_signal().clone();

    let task = tokio::spawn(
        async move {
            let result = worker_shared
                .worker
                .run(&token, &mut simulation, &output_dir, &cancel)
                .await;
            (simulation, result)
        }
        .in_current_span(),
    );

    match task.await {
        Ok((simulation, Ok(()))) => {
            let simulation = shared.project.add(simulation);
            job.token().done(None);
            JobOutcome::Done(simulation)
        }
        Ok((_, Err(e))) if e.is_cancelled() => {
            info!("worker observed cancellation");
            job.token().cancel(None);
            JobOutcome::Cancelled
        }
        Ok((_, Err(e))) => {
            warn!(error = %e, "worker failed");
            job.token().error(Some(&e.to_string()));
            JobOutcome::Failed(Arc::new(e))
        }
        Err(e) => {
            error!(error = %e, "worker task panicked");
            job.token().error(Some("Worker panicked"));
            JobOutcome::Failed(Arc::new(WorkerError::Failed(format!(
                "worker panicked: {e}"
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CancelSignal;
    use crate::model::{ParameterSet, Simulation};
    use std::path::Path;

    struct NoopWorker;

    impl Worker for NoopWorker {
        type Options = ParameterSet;

        async fn run(
            &self,
            token: &Token,
            _simulation: &mut Simulation<ParameterSet>,
            _output_dir: &Path,
            _cancel: &CancelSignal,
        ) -> std::result::Result<(), WorkerError> {
            token.done(None);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_submission_leaves_no_token_behind() {
        let config = RunnerConfig {
            max_workers: 1,
            output_dir: PathBuf::from("/tmp/simrun-runner-unit"),
        };
        let runner = LocalSimulationRunner::new(NoopWorker, config).unwrap();

        // Kill the dispatcher so its queue receiver is dropped.
        let dispatcher = runner.dispatcher.lock().take().unwrap();
        dispatcher.abort();
        assert!(dispatcher.await.unwrap_err().is_cancelled());

        let result = runner.submit(ParameterSet::new("sim"));
        assert!(matches!(result, Err(Error::Closed)));
        assert!(runner.token().get_subtokens(None).is_empty());
        assert_eq!(runner.state(), TokenState::NotStarted);
        assert_eq!(runner.submitted_count(), 0);
    }
}
