use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zephyr_runner::console::{ConsoleSink, MemoryConsole};
use zephyr_runner::core::{BuildRequest, BuildResult};
use zephyr_runner::error::BuildError;
use zephyr_runner::jobs::{BuildJob, JobManager, JobStatus, Operation};
use zephyr_runner::BuildRunner;

/// Runner that sleeps for `delay` and tracks how many calls overlap.
struct MockBuildRunner {
    delay: Duration,
    console: Arc<MemoryConsole>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
    fail_with: Option<String>,
}

impl MockBuildRunner {
    fn new(delay: Duration, console: Arc<MemoryConsole>) -> Self {
        Self {
            delay,
            console,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_with: None,
        }
    }

    async fn run(&self, label: &str, cancel: &CancellationToken) -> Result<BuildResult, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.console.write(format!("{}\n", label).as_bytes());

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.delay) => match &self.fail_with {
                Some(reason) => Err(BuildError::Configuration(reason.clone())),
                None => Ok(BuildResult::success()),
            },
            _ = cancel.cancelled() => Err(BuildError::Cancelled),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl BuildRunner for MockBuildRunner {
    async fn build(
        &self,
        _request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        self.run("building", cancel).await
    }

    async fn clean(
        &self,
        _request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildResult, BuildError> {
        self.run("cleaning", cancel).await
    }
}

async fn wait_for_status(manager: &JobManager, id: Uuid, status: JobStatus) -> BuildJob {
    for _ in 0..200 {
        if let Some(job) = manager.get_job(&id) {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}: {:?}", id, status, manager.get_job(&id));
}

fn request(dir: &str) -> BuildRequest {
    BuildRequest::new("/work/blinky", "qemu_x86").build_dir(dir)
}

#[tokio::test]
async fn test_job_completes_with_result_and_output() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(10), console.clone()));

    let id = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner, console);
    let job = wait_for_status(&manager, id, JobStatus::Completed).await;

    assert_eq!(job.operation, Operation::Build);
    assert_eq!(job.board, "qemu_x86");
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(job.output.as_deref(), Some("building\n"));
    assert!(job.result.unwrap().succeeded);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_runner_error_fails_job() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let mut runner = MockBuildRunner::new(Duration::from_millis(1), console.clone());
    runner.fail_with = Some("target board must not be empty".to_string());

    let id = manager.spawn_job(Operation::Clean, request("/work/blinky/build"), Arc::new(runner), console);
    let job = wait_for_status(&manager, id, JobStatus::Failed).await;

    assert!(job.result.is_none());
    assert!(job.error.unwrap().contains("target board must not be empty"));
}

#[tokio::test]
async fn test_jobs_on_same_build_dir_never_overlap() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(30), console.clone()));

    let ids: Vec<_> = (0..3)
        .map(|_| {
            manager.spawn_job(
                Operation::Build,
                request("/work/blinky/build"),
                runner.clone(),
                console.clone(),
            )
        })
        .collect();

    for id in ids {
        wait_for_status(&manager, id, JobStatus::Completed).await;
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_build_dir_spellings_share_one_lock() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(200), console.clone()));

    let a = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner.clone(), console.clone());
    let b = manager.spawn_job(
        Operation::Build,
        request("/work/blinky/sub/../build/."),
        runner.clone(),
        console,
    );

    wait_for_status(&manager, a, JobStatus::Completed).await;
    wait_for_status(&manager, b, JobStatus::Completed).await;
    assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cleanup_drops_idle_locks() {
    let manager = JobManager::new();
    let held = manager.build_dir_lock(Path::new("/work/a/build"));
    let idle = Arc::downgrade(&manager.build_dir_lock(Path::new("/work/b/build")));

    manager.cleanup_completed_jobs(3600);

    assert!(idle.upgrade().is_none());
    assert!(Arc::ptr_eq(&held, &manager.build_dir_lock(Path::new("/work/a/../a/build"))));
}

#[tokio::test]
async fn test_jobs_on_different_build_dirs_run_concurrently() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(200), console.clone()));

    let a = manager.spawn_job(Operation::Build, request("/work/a/build"), runner.clone(), console.clone());
    let b = manager.spawn_job(Operation::Build, request("/work/b/build"), runner.clone(), console);

    wait_for_status(&manager, a, JobStatus::Completed).await;
    wait_for_status(&manager, b, JobStatus::Completed).await;
    assert_eq!(runner.max_running.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_secs(30), console.clone()));

    let id = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner.clone(), console);
    wait_for_status(&manager, id, JobStatus::Running).await;

    assert_ok!(manager.cancel_job(&id));
    let job = wait_for_status(&manager, id, JobStatus::Cancelled).await;
    assert!(job.completed_at.is_some());

    // The runner observes the token and stops.
    for _ in 0..100 {
        if runner.running.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runner.running.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get_job(&id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(200), console.clone()));

    let first = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner.clone(), console.clone());
    wait_for_status(&manager, first, JobStatus::Running).await;
    let second = manager.spawn_job(Operation::Clean, request("/work/blinky/build"), runner.clone(), console);

    assert_eq!(manager.get_job(&second).unwrap().status, JobStatus::Queued);
    assert_ok!(manager.cancel_job(&second));

    wait_for_status(&manager, first, JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    let job = manager.get_job(&second).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
}

#[tokio::test]
async fn test_cancel_unknown_or_finished_job_fails() {
    let manager = JobManager::new();
    assert!(manager.cancel_job(&Uuid::new_v4()).is_err());

    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(1), console.clone()));
    let id = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner, console);
    wait_for_status(&manager, id, JobStatus::Completed).await;

    let err = manager.cancel_job(&id).unwrap_err();
    assert!(err.to_string().contains("already finished"));
    assert_eq!(manager.get_job(&id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_terminal_status_is_final() {
    let mut job = BuildJob::new(Operation::Build, &request("/work/blinky/build"));
    assert_eq!(job.status, JobStatus::Queued);

    job.start();
    job.cancel();
    job.complete(BuildResult::success(), "late".to_string());
    job.fail("late".to_string(), String::new());

    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
    assert_eq!(job.error.as_deref(), Some("Job cancelled"));
}

#[tokio::test]
async fn test_cleanup_keeps_recent_jobs() {
    let manager = JobManager::new();
    let console = Arc::new(MemoryConsole::new());
    let runner = Arc::new(MockBuildRunner::new(Duration::from_millis(1), console.clone()));
    let id = manager.spawn_job(Operation::Build, request("/work/blinky/build"), runner, console);
    wait_for_status(&manager, id, JobStatus::Completed).await;

    manager.cleanup_completed_jobs(3600);
    assert!(manager.get_job(&id).is_some());
    assert_eq!(manager.list_jobs().len(), 1);
}

#[test]
fn test_output_tail_limits_console_text() {
    let console = MemoryConsole::new();
    console.write(b"0123456789");
    assert_eq!(console.tail(4), "6789");
    assert_eq!(console.tail(100), "0123456789");
    assert_eq!(console.len(), 10);
}
