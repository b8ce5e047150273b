//! Indexing job state and the single coordinator that serializes jobs.
//!
//! At most one job is ever in `Scanning` or `Processing`. Starting a job
//! while another is active is rejected with `ConcurrentJobRejected`.
//! Maintenance operations (clear, folder removal) take an exclusive guard
//! from the same coordinator so they never overlap a running job.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    error::{Error, Result},
    record::now_unix,
    watcher::ChangeKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Scanning,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Scanning | JobStatus::Processing)
    }
}

/// What a job is indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Full { folder: PathBuf },
    Incremental { path: PathBuf, change: ChangeKind },
}

impl JobKind {
    /// Whether this job touches anything under `folder`.
    pub fn targets(&self, folder: &std::path::Path) -> bool {
        match self {
            JobKind::Full { folder: f } => f.starts_with(folder),
            JobKind::Incremental { path, .. } => path.starts_with(folder),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub path: String,
    pub message: String,
}

/// Immutable copy of the current job, as returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: u64,
    pub kind: Option<JobKind>,
    pub status: JobStatus,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<String>,
    pub started_at: Option<u64>,
    pub elapsed_seconds: f64,
    pub errors: Vec<JobError>,
    pub is_indexing: bool,
}

struct JobState {
    id: u64,
    kind: Option<JobKind>,
    status: JobStatus,
    total_files: usize,
    processed_files: usize,
    current_file: Option<String>,
    started_at: Option<u64>,
    started: Option<Instant>,
    frozen_elapsed: Option<f64>,
    errors: Vec<JobError>,
    cancel: Arc<AtomicBool>,
}

impl JobState {
    fn idle() -> Self {
        Self {
            id: 0,
            kind: None,
            status: JobStatus::Idle,
            total_files: 0,
            processed_files: 0,
            current_file: None,
            started_at: None,
            started: None,
            frozen_elapsed: None,
            errors: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn elapsed(&self) -> f64 {
        self.frozen_elapsed.unwrap_or_else(|| {
            self.started
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        })
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.current_file = None;
        self.frozen_elapsed = Some(self.elapsed());
    }
}

struct Inner {
    job: JobState,
    maintenance: bool,
}

/// Owner of the current [`JobState`] and the "one job at a time" guard.
pub struct JobCoordinator {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                job: JobState::idle(),
                maintenance: false,
            }),
            next_id: AtomicU64::new(1),
            idle: Notify::new(),
        }
    }
}

impl JobCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new job in `Scanning`, replacing the retained previous one.
    pub fn try_begin(self: &Arc<Self>, kind: JobKind) -> Result<JobHandle> {
        let mut inner = self.lock();
        if inner.job.status.is_active() || inner.maintenance {
            return Err(Error::ConcurrentJobRejected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        tracing::info!(job = id, kind = ?kind, "indexing job started");
        inner.job = JobState {
            id,
            kind: Some(kind),
            status: JobStatus::Scanning,
            started_at: Some(now_unix()),
            started: Some(Instant::now()),
            cancel: Arc::clone(&cancel),
            ..JobState::idle()
        };

        Ok(JobHandle {
            coordinator: Arc::clone(self),
            id,
            cancel,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        let job = &inner.job;
        JobSnapshot {
            id: job.id,
            kind: job.kind.clone(),
            status: job.status,
            total_files: job.total_files,
            processed_files: job.processed_files,
            current_file: job.current_file.clone(),
            started_at: job.started_at,
            elapsed_seconds: job.elapsed(),
            errors: job.errors.clone(),
            is_indexing: job.status.is_active(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().job.status.is_active()
    }

    /// The kind of the active job, if one is running.
    pub fn active_kind(&self) -> Option<JobKind> {
        let inner = self.lock();
        inner
            .job
            .status
            .is_active()
            .then(|| inner.job.kind.clone())
            .flatten()
    }

    /// Request cancellation of the active job if `pred` accepts it.
    /// Returns true if a cancel was requested.
    pub fn cancel_if(&self, pred: impl FnOnce(&JobKind) -> bool) -> bool {
        let inner = self.lock();
        let job = &inner.job;
        match &job.kind {
            Some(kind) if job.status.is_active() && pred(kind) => {
                job.cancel.store(true, Ordering::SeqCst);
                tracing::info!(job = job.id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Take the maintenance guard if no job is active.
    pub fn try_exclusive(self: &Arc<Self>) -> Result<MaintenanceGuard> {
        let mut inner = self.lock();
        if inner.job.status.is_active() || inner.maintenance {
            return Err(Error::ConcurrentJobRejected);
        }
        inner.maintenance = true;
        Ok(MaintenanceGuard {
            coordinator: Arc::clone(self),
        })
    }

    /// Wait for any active job or maintenance to finish, then take the
    /// maintenance guard.
    pub async fn exclusive_when_idle(self: &Arc<Self>) -> MaintenanceGuard {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Ok(guard) = self.try_exclusive() {
                return guard;
            }
            notified.await;
        }
    }

    /// Resolve once no job is active and no maintenance guard is held.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = {
                let inner = self.lock();
                inner.job.status.is_active() || inner.maintenance
            };
            if !busy {
                return;
            }
            notified.await;
        }
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut JobState)) {
        let mut inner = self.lock();
        if inner.job.id == id && inner.job.status.is_active() {
            f(&mut inner.job);
        }
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator").finish_non_exhaustive()
    }
}

/// Write access to the one active job. Only the pipeline holds one.
///
/// Dropping a handle while its job is still active marks the job `Failed`,
/// so a panicking or aborted task cannot leave the coordinator stuck.
pub struct JobHandle {
    coordinator: Arc<JobCoordinator>,
    id: u64,
    cancel: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Scanning is done; `total` files will be processed.
    pub fn set_processing(&self, total: usize) {
        self.coordinator.update(self.id, |job| {
            job.status = JobStatus::Processing;
            job.total_files = total;
        });
    }

    pub fn start_file(&self, path: &str) {
        self.coordinator.update(self.id, |job| {
            job.current_file = Some(path.to_string());
        });
    }

    /// Count a finished file, recording its error if it failed.
    pub fn finish_file(&self, path: &str, error: Option<String>) {
        self.coordinator.update(self.id, |job| {
            job.processed_files += 1;
            if let Some(message) = error {
                job.errors.push(JobError {
                    path: path.to_string(),
                    message,
                });
            }
        });
    }

    /// Record an error that is not tied to a counted file.
    pub fn record_error(&self, path: &str, message: String) {
        self.coordinator.update(self.id, |job| {
            job.errors.push(JobError {
                path: path.to_string(),
                message,
            });
        });
    }

    /// Finish as `Completed`, or `Cancelled` if a cancel was requested.
    pub fn complete(self) -> JobStatus {
        let status = if self.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.end(status, None);
        status
    }

    /// Finish as `Failed` with a single top-level error.
    pub fn fail(self, path: &str, message: String) {
        self.end(
            JobStatus::Failed,
            Some(JobError {
                path: path.to_string(),
                message,
            }),
        );
    }

    fn end(&self, status: JobStatus, error: Option<JobError>) {
        self.coordinator.update(self.id, |job| {
            if let Some(error) = error {
                job.errors.push(error);
            }
            job.finish(status);
            tracing::info!(
                job = job.id,
                status = ?status,
                processed = job.processed_files,
                total = job.total_files,
                errors = job.errors.len(),
                "indexing job finished"
            );
        });
        self.coordinator.idle.notify_waiters();
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        let mut aborted = false;
        self.coordinator.update(self.id, |job| {
            job.errors.push(JobError {
                path: String::new(),
                message: "indexing job aborted".into(),
            });
            job.finish(JobStatus::Failed);
            aborted = true;
        });
        if aborted {
            tracing::warn!(job = self.id, "indexing job aborted");
            self.coordinator.idle.notify_waiters();
        }
    }
}

/// Held while clearing the index or removing a folder. No job can start
/// until it is dropped.
pub struct MaintenanceGuard {
    coordinator: Arc<JobCoordinator>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.coordinator.lock().maintenance = false;
        self.coordinator.idle.notify_waiters();
    }
}
