//! The indexing pipeline: full folder scans and single-path incremental
//! jobs, both run under the [`JobCoordinator`].

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use futures::{StreamExt, stream};
use tokio::sync::mpsc;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    incremental::diff_folder,
    ingestion::{IngestOutcome, Ingestor},
    job::{JobCoordinator, JobHandle, JobKind, JobStatus},
    record::now_unix,
    registry::FolderRegistry,
    walker::{DiscoveredFile, ScanOptions, discover_files},
    watcher::{ChangeEvent, ChangeKind, FolderWatcher, PendingChanges},
};

pub struct Pipeline {
    ingestor: Ingestor,
    registry: FolderRegistry,
    config_db: Arc<ConfigDb>,
    coordinator: Arc<JobCoordinator>,
    watcher: Option<Arc<FolderWatcher>>,
    scan_options: ScanOptions,
    workers: usize,
    pending: Mutex<PendingChanges>,
}

impl Pipeline {
    pub fn new(
        ingestor: Ingestor,
        config_db: Arc<ConfigDb>,
        coordinator: Arc<JobCoordinator>,
        watcher: Option<Arc<FolderWatcher>>,
        scan_options: ScanOptions,
        workers: usize,
    ) -> Self {
        Self {
            ingestor,
            registry: FolderRegistry::new(Arc::clone(&config_db)),
            config_db,
            coordinator,
            watcher,
            scan_options,
            workers: workers.max(1),
            pending: Mutex::default(),
        }
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    pub fn watcher(&self) -> Option<&Arc<FolderWatcher>> {
        self.watcher.as_ref()
    }

    /// Claim the coordinator for a full scan of `folder`. The returned handle
    /// must be passed to [`Pipeline::run_full_scan`].
    pub fn begin_full_scan(&self, folder: &Path) -> Result<(PathBuf, JobHandle)> {
        let folder = FolderRegistry::normalize(folder);
        let handle = self.coordinator.try_begin(JobKind::Full {
            folder: folder.clone(),
        })?;
        Ok((folder, handle))
    }

    /// Start a full scan in the background and return its job id.
    pub fn start_full_scan(self: &Arc<Self>, folder: &Path) -> Result<u64> {
        let (folder, handle) = self.begin_full_scan(folder)?;
        let id = handle.id();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.run_full_scan(&folder, handle).await;
        });
        Ok(id)
    }

    /// Scan `folder`, prune vanished files and index new or changed ones
    /// through a bounded worker pool.
    ///
    /// Cancellation is checked before each file is picked up. Files already
    /// in flight are awaited, so the job ends only after their writes land.
    pub async fn run_full_scan(&self, folder: &Path, handle: JobHandle) -> JobStatus {
        let label = folder.to_string_lossy().into_owned();

        let scan = {
            let folder = folder.to_path_buf();
            let options = self.scan_options.clone();
            tokio::task::spawn_blocking(move || discover_files(&folder, &options))
                .await
                .map_err(Error::from)
                .and_then(|r| r)
        };
        let files = match scan {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(folder = %label, error = %e, "cannot scan folder");
                handle.fail(&label, e.to_string());
                return JobStatus::Failed;
            }
        };

        if let Err(e) = self.registry.add(folder) {
            handle.fail(&label, e.to_string());
            return JobStatus::Failed;
        }
        if let Some(watcher) = &self.watcher
            && let Err(e) = watcher.watch(folder)
        {
            tracing::warn!(folder = %label, error = %e, "cannot watch folder");
        }

        let diff = match diff_folder(&self.config_db, folder, &files) {
            Ok(diff) => diff,
            Err(e) => {
                handle.fail(&label, e.to_string());
                return JobStatus::Failed;
            }
        };

        if !diff.deleted_paths.is_empty() {
            tracing::info!(
                folder = %label,
                count = diff.deleted_paths.len(),
                "pruning records for vanished files"
            );
            if let Err(e) = self.ingestor.remove_all(&diff.deleted_paths).await {
                handle.record_error(&label, e.to_string());
            }
        }

        handle.set_processing(files.len());
        for file in &diff.unchanged_files {
            handle.finish_file(&file.path.to_string_lossy(), None);
        }
        tracing::debug!(
            folder = %label,
            pending = diff.needs_processing(),
            unchanged = diff.unchanged_files.len(),
            "scan complete"
        );

        let work = diff.new_files.into_iter().chain(diff.changed_files);
        stream::iter(work)
            .map(|file| self.process(&handle, file))
            .buffer_unordered(self.workers)
            .collect::<()>()
            .await;

        if !handle.is_cancelled()
            && let Err(e) = self.registry.mark_scanned(folder, now_unix())
        {
            tracing::warn!(folder = %label, error = %e, "cannot record scan time");
        }
        handle.complete()
    }

    async fn process(&self, handle: &JobHandle, file: DiscoveredFile) {
        if handle.is_cancelled() {
            return;
        }
        let path = file.path.to_string_lossy().into_owned();
        handle.start_file(&path);
        let error = match self.ingestor.ingest(&file).await {
            Ok(IngestOutcome::Indexed) => None,
            Ok(IngestOutcome::IndexedWithoutModel(e)) => Some(e.to_string()),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "failed to index file");
                Some(e.to_string())
            }
        };
        handle.finish_file(&path, error);
    }

    /// Run one incremental job for a watcher change.
    ///
    /// Paths outside every registered folder are ignored. Returns
    /// `ConcurrentJobRejected` when another job holds the coordinator.
    pub async fn apply_change(&self, event: &ChangeEvent) -> Result<Option<JobStatus>> {
        if self.registry.owner_of(&event.path)?.is_none() {
            tracing::debug!(path = %event.path.display(), "change outside watched folders");
            return Ok(None);
        }
        let handle = self.coordinator.try_begin(JobKind::Incremental {
            path: event.path.clone(),
            change: event.kind,
        })?;
        let label = event.path.to_string_lossy().into_owned();

        // The folder may have been removed before the job started.
        if self.registry.owner_of(&event.path)?.is_none() {
            tracing::debug!(path = %label, "folder removed before change was applied");
            handle.set_processing(0);
            return Ok(Some(handle.complete()));
        }

        let file = match event.kind {
            ChangeKind::Deleted => None,
            ChangeKind::Created | ChangeKind::Modified => {
                DiscoveredFile::stat(&event.path, &self.scan_options)
            }
        };

        match file {
            Some(file) => {
                handle.set_processing(1);
                self.process(&handle, file).await;
            }
            // Deleted, or no longer an eligible file by the time we got here.
            None => {
                handle.set_processing(0);
                if let Err(e) = self.ingestor.remove(&event.path).await {
                    handle.record_error(&label, e.to_string());
                }
            }
        }
        Ok(Some(handle.complete()))
    }

    fn pending(&self) -> MutexGuard<'_, PendingChanges> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget queued watcher changes under `folder`.
    pub fn discard_pending_under(&self, folder: &Path) {
        self.pending().discard_under(folder);
    }

    /// Feed watcher events into incremental jobs until the channel closes.
    ///
    /// Events are coalesced per path while they wait. A change rejected
    /// because another job is running goes back to the front of the queue
    /// and is retried once the coordinator is idle.
    pub async fn drain_changes(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
        loop {
            if self.pending().is_empty() {
                match events.recv().await {
                    Some(event) => self.pending().push(event),
                    None => break,
                }
            }
            while let Ok(event) = events.try_recv() {
                self.pending().push(event);
            }

            let Some(event) = self.pending().pop() else {
                continue;
            };
            match self.apply_change(&event).await {
                Ok(_) => {}
                Err(Error::ConcurrentJobRejected) => {
                    self.pending().push_front(event);
                    self.coordinator.wait_until_idle().await;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %event.path.display(),
                        error = %e,
                        "failed to apply file change"
                    );
                }
            }
        }
        tracing::debug!("watcher channel closed");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("ingestor", &self.ingestor)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
