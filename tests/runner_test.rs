//! Integration tests for the local simulation runner.

use simrun::engine::{
    CancelSignal, JobState, LocalSimulationRunner, RunnerConfig, SubmitResult, Worker,
};
use simrun::error::{Error, WorkerError};
use simrun::model::{Fingerprinter, Options, Simulation, identifier};
use simrun::project::Project;
use simrun::token::{Token, TokenState};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Test worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
}

#[derive(Debug, Clone, PartialEq)]
struct Case {
    id: i64,
    behavior: Behavior,
}

impl Options for Case {
    fn fingerprint(&self, fp: &mut Fingerprinter) {
        fp.field("id").write_i64(self.id);
        fp.field("behavior").write_i64(self.behavior as i64);
    }
}

fn ok(id: i64) -> Case {
    Case {
        id,
        behavior: Behavior::Succeed,
    }
}

fn failing(id: i64) -> Case {
    Case {
        id,
        behavior: Behavior::Fail,
    }
}

fn panicking(id: i64) -> Case {
    Case {
        id,
        behavior: Behavior::Panic,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Output(i64);

#[derive(Default)]
struct Stats {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<i64>>,
}

/// Succeeds, fails or panics as its options say. With a gate, each run
/// blocks until the test adds a permit or the job is cancelled.
#[derive(Clone, Default)]
struct TestWorker {
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    stats: Arc<Stats>,
}

impl TestWorker {
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let worker = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (worker, gate)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn runs(&self) -> usize {
        self.stats.runs.load(Ordering::SeqCst)
    }

    async fn body(
        &self,
        token: &Token,
        simulation: &mut Simulation<Case>,
        cancel: &CancelSignal,
    ) -> Result<(), WorkerError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    permit.map_err(|e| WorkerError::Failed(e.to_string()))?.forget();
                }
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            }
        } else {
            tokio::time::sleep(self.delay).await;
        }
        cancel.checkpoint()?;
        token.update_running(0.5, "halfway");

        let options = simulation.options().clone();
        match options.behavior {
            Behavior::Succeed => {
                simulation.add_result(Output(options.id * 10));
                Ok(())
            }
            Behavior::Fail => Err(WorkerError::Failed(format!("case {} diverged", options.id))),
            Behavior::Panic => panic!("case {} crashed", options.id),
        }
    }
}

impl Worker for TestWorker {
    type Options = Case;

    async fn run(
        &self,
        token: &Token,
        simulation: &mut Simulation<Case>,
        _output_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), WorkerError> {
        token.start(None);
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        self.stats
            .started
            .lock()
            .unwrap()
            .push(simulation.options().id);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);

        let result = self.body(token, simulation, cancel).await;

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn config(max_workers: usize) -> RunnerConfig {
    RunnerConfig {
        max_workers,
        output_dir: PathBuf::from("/tmp/simrun-runner-test"),
    }
}

fn runner(worker: TestWorker, max_workers: usize) -> LocalSimulationRunner<TestWorker> {
    LocalSimulationRunner::new(worker, config(max_workers)).expect("runner should start")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn scheduled(result: SubmitResult<Case>) -> simrun::engine::JobHandle<Case> {
    match result {
        SubmitResult::Scheduled(handle) => handle,
        other => panic!("expected Scheduled, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Basic scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_submission_lands_in_project() {
    let worker = TestWorker::default();
    let runner = runner(worker.clone(), 2);

    let handle = scheduled(runner.submit(ok(1)).unwrap());
    let simulation = handle.result().await.unwrap();
    assert_eq!(simulation.find_results::<Output>()[0].as_ref(), &Output(10));

    runner.shutdown().await.unwrap();

    assert_eq!(runner.project().len(), 1);
    assert_eq!(runner.done_count(), 1);
    assert_eq!(runner.state(), TokenState::Done);
    assert!((runner.progress() - 1.0).abs() < 1e-9);
    assert_eq!(handle.state(), JobState::Done);
    assert_eq!(handle.token_state(), TokenState::Done);
    assert_eq!(worker.runs(), 1);
}

#[tokio::test]
async fn content_equal_submission_runs_once() {
    let worker = TestWorker::with_delay(Duration::from_millis(20));
    let runner = runner(worker.clone(), 2);

    let first = runner.submit(ok(1)).unwrap();
    let second = runner.submit(ok(1)).unwrap();
    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert!(matches!(second, SubmitResult::InFlight(_)));
    assert_eq!(first.identifier(), second.identifier());

    let a = first.result().await.unwrap();
    let b = second.result().await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let third = runner.submit(ok(1)).unwrap();
    assert!(matches!(third, SubmitResult::Completed(_)));
    assert!(third.handle().is_none());

    runner.shutdown().await.unwrap();
    assert_eq!(runner.project().len(), 1);
    assert_eq!(runner.submitted_count(), 1);
    assert_eq!(worker.runs(), 1);
}

#[tokio::test]
async fn cancel_before_slot_never_runs() {
    let worker = TestWorker::default();
    let runner = runner(worker.clone(), 1);

    // No await between submit and cancel: the dispatcher cannot have
    // picked the job up yet.
    let handle = scheduled(runner.submit(ok(1)).unwrap());
    handle.cancel();
    assert_eq!(handle.state(), JobState::Cancelled);

    assert!(matches!(handle.result().await, Err(Error::Cancelled)));
    runner.shutdown().await.unwrap();

    assert_eq!(runner.project().len(), 0);
    assert_eq!(runner.cancelled_count(), 1);
    assert_eq!(handle.token_state(), TokenState::Cancelled);
    assert_eq!(worker.runs(), 0);
}

#[tokio::test]
async fn worker_failure_is_reported_on_the_handle() {
    let worker = TestWorker::default();
    let runner = runner(worker.clone(), 2);

    let bad = scheduled(runner.submit(failing(1)).unwrap());
    let good = scheduled(runner.submit(ok(2)).unwrap());

    match bad.result().await {
        Err(Error::Worker(e)) => assert_eq!(e.to_string(), "case 1 diverged"),
        other => panic!("expected worker error, got {other:?}"),
    }
    good.result().await.unwrap();
    runner.shutdown().await.unwrap();

    assert_eq!(runner.project().len(), 1);
    assert_eq!(runner.failed_count(), 1);
    assert_eq!(runner.done_count(), 1);
    assert_eq!(bad.state(), JobState::Error);
    assert_eq!(bad.token_state(), TokenState::Error);
    assert_eq!(bad.status(), "case 1 diverged");
    assert_eq!(runner.state(), TokenState::Error);
}

#[tokio::test]
async fn worker_panic_fails_only_that_job() {
    let runner = runner(TestWorker::default(), 2);

    let crashed = scheduled(runner.submit(panicking(1)).unwrap());
    let fine = scheduled(runner.submit(ok(2)).unwrap());

    assert!(matches!(crashed.result().await, Err(Error::Worker(_))));
    fine.result().await.unwrap();
    runner.shutdown().await.unwrap();

    assert_eq!(runner.failed_count(), 1);
    assert_eq!(runner.done_count(), 1);
    assert_eq!(runner.project().len(), 1);
}

#[tokio::test]
async fn failed_options_can_be_resubmitted() {
    let worker = TestWorker::default();
    let runner = runner(worker.clone(), 1);

    let first = scheduled(runner.submit(failing(1)).unwrap());
    assert!(first.result().await.is_err());

    let retry = runner.submit(failing(1)).unwrap();
    assert!(matches!(retry, SubmitResult::Scheduled(_)));
    assert!(retry.result().await.is_err());

    runner.shutdown().await.unwrap();
    assert_eq!(worker.runs(), 2);
    assert_eq!(runner.failed_count(), 2);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_job_stops_at_checkpoint() {
    let (worker, _gate) = TestWorker::gated();
    let runner = runner(worker.clone(), 1);

    let handle = scheduled(runner.submit(ok(1)).unwrap());
    wait_until(|| worker.runs() == 1).await;
    assert_eq!(handle.state(), JobState::Running);
    assert_eq!(runner.running_count(), 1);

    handle.cancel();
    assert!(matches!(handle.result().await, Err(Error::Cancelled)));
    runner.shutdown().await.unwrap();

    assert_eq!(handle.token_state(), TokenState::Cancelled);
    assert_eq!(runner.cancelled_count(), 1);
    assert!(runner.project().is_empty());
}

#[tokio::test]
async fn pending_job_cancelled_while_slot_is_busy() {
    let (worker, gate) = TestWorker::gated();
    let runner = runner(worker.clone(), 1);

    let busy = scheduled(runner.submit(ok(1)).unwrap());
    let waiting = scheduled(runner.submit(ok(2)).unwrap());
    wait_until(|| worker.runs() == 1).await;

    waiting.cancel();
    assert!(matches!(waiting.result().await, Err(Error::Cancelled)));

    gate.add_permits(1);
    busy.result().await.unwrap();
    runner.shutdown().await.unwrap();

    assert_eq!(worker.runs(), 1);
    assert_eq!(runner.cancelled_count(), 1);
    assert_eq!(runner.done_count(), 1);
    assert_eq!(runner.project().len(), 1);
}

#[tokio::test]
async fn runner_cancel_stops_everything() {
    let (worker, _gate) = TestWorker::gated();
    let runner = runner(worker.clone(), 1);

    let handles: Vec<_> = (1..=3)
        .map(|id| scheduled(runner.submit(ok(id)).unwrap()))
        .collect();
    wait_until(|| worker.runs() == 1).await;

    runner.cancel();
    runner.shutdown().await.unwrap();

    for handle in &handles {
        assert_eq!(handle.state(), JobState::Cancelled);
    }
    assert_eq!(runner.cancelled_count(), 3);
    assert_eq!(worker.runs(), 1);
    assert!(runner.project().is_empty());
    assert_eq!(runner.state(), TokenState::Cancelled);
}

#[tokio::test]
async fn cancelled_options_can_be_resubmitted() {
    let runner = runner(TestWorker::default(), 1);

    let first = scheduled(runner.submit(ok(1)).unwrap());
    first.cancel();

    let again = runner.submit(ok(1)).unwrap();
    assert!(matches!(again, SubmitResult::Scheduled(_)));
    again.result().await.unwrap();
    runner.shutdown().await.unwrap();

    assert_eq!(runner.cancelled_count(), 1);
    assert_eq!(runner.done_count(), 1);
}

#[tokio::test]
async fn dropping_runner_cancels_its_jobs() {
    let (worker, _gate) = TestWorker::gated();
    let runner = runner(worker.clone(), 1);

    let running = scheduled(runner.submit(ok(1)).unwrap());
    let pending = scheduled(runner.submit(ok(2)).unwrap());
    wait_until(|| worker.runs() == 1).await;

    drop(runner);

    assert!(matches!(running.result().await, Err(Error::Cancelled)));
    assert!(matches!(pending.result().await, Err(Error::Cancelled)));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_slot_runs_one_at_a_time_in_submission_order() {
    let worker = TestWorker::with_delay(Duration::from_millis(10));
    let runner = runner(worker.clone(), 1);

    let results = runner.submit_all((1..=4).map(ok)).unwrap();
    for result in &results {
        result.result().await.unwrap();
    }
    runner.shutdown().await.unwrap();

    assert_eq!(worker.stats.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(*worker.stats.started.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(runner.project().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_runs_never_exceed_max_workers() {
    let worker = TestWorker::with_delay(Duration::from_millis(20));
    let runner = runner(worker.clone(), 3);

    runner.submit_all((1..=12).map(ok)).unwrap();
    runner.shutdown().await.unwrap();

    let max_active = worker.stats.max_active.load(Ordering::SeqCst);
    assert!(max_active <= 3, "max_active = {max_active}");
    assert!(max_active >= 2, "slots were not used in parallel");
    assert_eq!(runner.done_count(), 12);
    assert_eq!(runner.project().len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_equal_submissions_schedule_once() {
    let worker = TestWorker::with_delay(Duration::from_millis(20));
    let runner = Arc::new(runner(worker.clone(), 4));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.submit(ok(7)).unwrap() })
        })
        .collect();

    let mut scheduled_count = 0;
    for task in tasks {
        let result = task.await.unwrap();
        if !result.is_duplicate() {
            scheduled_count += 1;
        }
        result.result().await.unwrap();
    }
    runner.shutdown().await.unwrap();

    assert_eq!(scheduled_count, 1);
    assert_eq!(worker.runs(), 1);
    assert_eq!(runner.project().len(), 1);
}

// ---------------------------------------------------------------------------
// Lifecycle and accessors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_workers_is_rejected() {
    let result = LocalSimulationRunner::new(TestWorker::default(), config(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn runner_requires_a_tokio_runtime() {
    let result = LocalSimulationRunner::new(TestWorker::default(), config(1));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn submissions_after_shutdown_are_rejected() {
    let runner = runner(TestWorker::default(), 1);
    runner.submit(ok(1)).unwrap();
    runner.shutdown().await.unwrap();

    assert!(runner.is_closed());
    assert!(matches!(runner.submit(ok(2)), Err(Error::Closed)));
    // Shutting down twice is harmless.
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn existing_project_entries_are_not_rerun() {
    let project = Project::new();
    project.add(Simulation::new(ok(1)));

    let worker = TestWorker::default();
    let runner =
        LocalSimulationRunner::with_project(worker.clone(), config(1), project).unwrap();

    let result = runner.submit(ok(1)).unwrap();
    assert!(matches!(result, SubmitResult::Completed(_)));
    runner.shutdown().await.unwrap();

    assert_eq!(worker.runs(), 0);
    assert_eq!(runner.submitted_count(), 0);
}

#[tokio::test]
async fn output_directories_default_under_config_root() {
    let runner = runner(TestWorker::default(), 1);

    let default = scheduled(runner.submit(ok(1)).unwrap());
    let id = identifier(&ok(1));
    assert_eq!(
        default.output_dir(),
        Path::new("/tmp/simrun-runner-test").join(id.short())
    );

    let explicit = scheduled(runner.submit_in(ok(2), "/tmp/elsewhere/run-2").unwrap());
    assert_eq!(explicit.output_dir(), Path::new("/tmp/elsewhere/run-2"));

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn job_tokens_hang_off_the_root() {
    let runner = runner(TestWorker::default(), 2);
    runner.submit_all([ok(1), ok(2), ok(1)]).unwrap();

    let jobs = runner.jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(runner.token().get_subtokens(Some("simulation")).len(), 2);

    runner.shutdown().await.unwrap();

    let summary = runner.summary();
    assert_eq!(summary.submitted, 2);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.pending + summary.running, 0);
    assert_eq!(summary.simulations, 2);

    let json = serde_json::to_value(summary).unwrap();
    assert_eq!(json["done"], 2);
    assert_eq!(runner.status(), "Done");
}

#[tokio::test]
async fn wait_keeps_accepting_submissions() {
    let runner = runner(TestWorker::default(), 2);
    runner.submit(ok(1)).unwrap();
    runner.wait().await;
    assert_eq!(runner.done_count(), 1);

    let next = runner.submit(ok(2)).unwrap();
    assert!(matches!(next, SubmitResult::Scheduled(_)));
    runner.wait().await;
    assert_eq!(runner.done_count(), 2);
    assert!(!runner.is_closed());
}
