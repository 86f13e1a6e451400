//! Jobs: one scheduled execution of a worker for one options value.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::signal::CancelSignal;
use crate::error::{Error, Result, WorkerError};
use crate::model::{Identifier, Options, Simulation};
use crate::token::{Token, TokenState};

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a free slot.
    Pending,
    /// Worker executing.
    Running,
    /// Worker returned; simulation added to the project. Terminal.
    Done,
    /// Cancelled before a slot, or the worker observed cancellation. Terminal.
    Cancelled,
    /// Worker failed. Terminal.
    Error,
}

impl JobState {
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Done)
                | (Running, Cancelled)
                | (Running, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Error)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome published once per job.
#[derive(Clone)]
pub(crate) enum JobOutcome<O> {
    Done(Arc<Simulation<O>>),
    Cancelled,
    Failed(Arc<WorkerError>),
}

impl<O> JobOutcome<O> {
    pub(crate) fn state(&self) -> JobState {
        match self {
            JobOutcome::Done(_) => JobState::Done,
            JobOutcome::Cancelled => JobState::Cancelled,
            JobOutcome::Failed(_) => JobState::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub(crate) struct Job<O> {
    id: JobId,
    identifier: Identifier,
    options: O,
    token: Token,
    output_dir: PathBuf,
    cancel: CancelSignal,
    submitted_at: DateTime<Utc>,
    state: Mutex<JobState>,
    /// Taken by the executing task; `None` afterwards.
    simulation: Mutex<Option<Simulation<O>>>,
    outcome: watch::Sender<Option<JobOutcome<O>>>,
}

impl<O: Options> Job<O> {
    pub(crate) fn new(simulation: Simulation<O>, token: Token, output_dir: PathBuf) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: JobId::new(),
            identifier: simulation.identifier(),
            options: simulation.options().clone(),
            token,
            output_dir,
            cancel: CancelSignal::new(),
            submitted_at: Utc::now(),
            state: Mutex::new(JobState::Pending),
            simulation: Mutex::new(Some(simulation)),
            outcome,
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub(crate) fn token(&self) -> &Token {
        &self.token
    }

    pub(crate) fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub(crate) fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub(crate) fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub(crate) fn take_simulation(&self) -> Option<Simulation<O>> {
        self.simulation.lock().take()
    }

    /// PENDING → RUNNING. False if the job was cancelled first.
    pub(crate) fn try_start(&self) -> bool {
        let mut state = self.state.lock();
        if *state == JobState::Pending {
            *state = JobState::Running;
            true
        } else {
            false
        }
    }

    /// Record the terminal outcome. Returns false if the job was already
    /// terminal, in which case nothing changes.
    pub(crate) fn finish(&self, outcome: JobOutcome<O>) -> bool {
        let mut state = self.state.lock();
        let to = outcome.state();
        if !state.can_transition_to(to) {
            return false;
        }
        *state = to;
        self.outcome.send_replace(Some(outcome));
        true
    }

    /// Cancel the job. A pending job becomes CANCELLED immediately; a running
    /// job is signalled and stops at its worker's next checkpoint.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == JobState::Pending {
            *state = JobState::Cancelled;
            self.token.cancel(Some("Cancelled before start"));
            self.simulation.lock().take();
            self.outcome.send_replace(Some(JobOutcome::Cancelled));
        }
        drop(state);
        self.cancel.cancel();
    }

    fn outcome(&self) -> Option<JobOutcome<O>> {
        self.outcome.borrow().clone()
    }

    /// Wait for the terminal outcome.
    pub(crate) async fn wait(&self) -> Result<JobOutcome<O>> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Other(format!("job {} dropped its outcome", self.id)))?
            .clone();
        outcome.ok_or_else(|| Error::Other(format!("job {} has no outcome", self.id)))
    }
}

impl<O> JobOutcome<O> {
    fn into_result(self) -> Result<Arc<Simulation<O>>> {
        match self {
            JobOutcome::Done(simulation) => Ok(simulation),
            JobOutcome::Cancelled => Err(Error::Cancelled),
            JobOutcome::Failed(error) => Err(Error::Worker(error)),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Caller-facing handle to a submitted job. Cheap to clone.
pub struct JobHandle<O> {
    job: Arc<Job<O>>,
}

impl<O> Clone for JobHandle<O> {
    fn clone(&self) -> Self {
        Self {
            job: Arc::clone(&self.job),
        }
    }
}

impl<O: Options> JobHandle<O> {
    pub(crate) fn new(job: Arc<Job<O>>) -> Self {
        Self { job }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn identifier(&self) -> Identifier {
        self.job.identifier
    }

    pub fn options(&self) -> &O {
        &self.job.options
    }

    pub fn output_dir(&self) -> &Path {
        &self.job.output_dir
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.job.submitted_at
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn token(&self) -> &Token {
        &self.job.token
    }

    pub fn token_state(&self) -> TokenState {
        self.job.token.state()
    }

    pub fn progress(&self) -> f64 {
        self.job.token.progress()
    }

    pub fn status(&self) -> String {
        self.job.token.status()
    }

    pub fn cancel(&self) {
        self.job.cancel();
    }

    /// Wait until the job is terminal. Returns the simulation on success,
    /// [`Error::Cancelled`] if it was cancelled, or the worker's error.
    pub async fn result(&self) -> Result<Arc<Simulation<O>>> {
        self.job.wait().await?.into_result()
    }

    /// Non-blocking variant of [`result`](Self::result); `None` while the job
    /// is still pending or running.
    pub fn try_result(&self) -> Option<Result<Arc<Simulation<O>>>> {
        self.job.outcome().map(JobOutcome::into_result)
    }
}

impl<O: Options> std::fmt::Debug for JobHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.job.id)
            .field("identifier", &self.job.identifier)
            .field("state", &self.state())
            .finish()
    }
}
