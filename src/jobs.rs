use crate::console::MemoryConsole;
use crate::core::{BuildKind, BuildRequest, BuildResult};
use crate::error::BuildError;
use crate::BuildRunner;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Build,
    Clean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    pub operation: Operation,
    pub kind: BuildKind,
    pub status: JobStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub project_root: PathBuf,
    pub build_dir: PathBuf,
    pub board: String,
    pub output: Option<String>,
    pub result: Option<BuildResult>,
    pub error: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl BuildJob {
    pub fn new(operation: Operation, request: &BuildRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            kind: request.build_kind(),
            status: JobStatus::Queued,
            created_at: unix_now(),
            started_at: None,
            completed_at: None,
            project_root: request.project_root().to_path_buf(),
            build_dir: request.build_directory().to_path_buf(),
            board: request.target_id().to_string(),
            output: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(unix_now());
    }

    pub fn complete(&mut self, result: BuildResult, output: String) {
        if self.is_finished() {
            return;
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(unix_now());
        self.output = Some(output);
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: String, output: String) {
        if self.is_finished() {
            return;
        }
        self.status = JobStatus::Failed;
        self.completed_at = Some(unix_now());
        self.output = Some(output);
        self.error = Some(error);
    }

    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(unix_now());
        self.error = Some("Job cancelled".to_string());
    }
}

/// Registry of build jobs. Jobs touching the same build directory run one
/// at a time, in submission order.
#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<Uuid, BuildJob>>>,
    handles: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_job(&self, job: BuildJob) -> (Uuid, CancellationToken) {
        let job_id = job.id;
        let token = CancellationToken::new();
        self.jobs.write().insert(job_id, job);
        self.tokens.write().insert(job_id, token.clone());
        (job_id, token)
    }

    pub fn get_job(&self, job_id: &Uuid) -> Option<BuildJob> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn update_job<F>(&self, job_id: &Uuid, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut BuildJob),
    {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            update_fn(job);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Job not found: {}", job_id))
        }
    }

    pub fn list_jobs(&self) -> Vec<BuildJob> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn build_dir_lock(&self, build_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(lock_key(build_dir))
            .or_default()
            .clone()
    }

    pub fn spawn_job(
        &self,
        operation: Operation,
        request: BuildRequest,
        runner: Arc<dyn BuildRunner>,
        console: Arc<MemoryConsole>,
    ) -> Uuid {
        let (job_id, token) = self.submit_job(BuildJob::new(operation, &request));
        let lock = self.build_dir_lock(request.build_directory());
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            let _guard = tokio::select! {
                guard = lock.lock_owned() => guard,
                _ = token.cancelled() => return,
            };
            if token.is_cancelled() || manager.update_job(&job_id, |job| job.start()).is_err() {
                return;
            }
            tracing::info!("Job {} started: {:?} {:?}", job_id, operation, request.project_root());

            let outcome = match operation {
                Operation::Build => runner.build(&request, &token).await,
                Operation::Clean => runner.clean(&request, &token).await,
            };
            let output = console.tail(OUTPUT_TAIL_CHARS);

            let _ = manager.update_job(&job_id, |job| match outcome {
                Ok(result) => job.complete(result, output),
                Err(BuildError::Cancelled) => job.cancel(),
                Err(e) => job.fail(e.to_string(), output),
            });
            manager.tokens.write().remove(&job_id);
            tracing::info!("Job {} finished", job_id);
        });

        self.handles.write().insert(job_id, handle);
        job_id
    }

    pub fn cleanup_completed_jobs(&self, max_age_seconds: u64) {
        let now = unix_now();

        let mut jobs_to_remove = Vec::new();

        {
            let jobs = self.jobs.read();
            for (id, job) in jobs.iter() {
                if let Some(completed_at) = job.completed_at {
                    if now.saturating_sub(completed_at) > max_age_seconds {
                        jobs_to_remove.push(*id);
                    }
                }
            }
        }

        let mut jobs = self.jobs.write();
        let mut handles = self.handles.write();
        let mut tokens = self.tokens.write();

        for job_id in jobs_to_remove {
            jobs.remove(&job_id);
            tokens.remove(&job_id);
            handles.remove(&job_id);
        }

        // Only the map holds an idle lock.
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn cancel_job(&self, job_id: &Uuid) -> Result<()> {
        let job = self
            .get_job(job_id)
            .ok_or_else(|| anyhow::anyhow!("Job not found: {}", job_id))?;
        if job.is_finished() {
            return Err(anyhow::anyhow!("Job already finished: {}", job_id));
        }

        if let Some(token) = self.tokens.read().get(job_id) {
            token.cancel();
        }

        self.update_job(job_id, |job| job.cancel())
    }
}

// Callers canonicalize paths that exist; this folds the remaining `.` and `..`.
fn lock_key(path: &Path) -> PathBuf {
    let mut key = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                key.pop();
            }
            other => key.push(other),
        }
    }
    key
}
