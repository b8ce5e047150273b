//! Process wiring: the [`FileGuessr`] facade owns every component and
//! exposes the operations served over HTTP and the CLI.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    backend::{BackendKind, BackendStatus, IndexBackend, select_backend},
    config::Config,
    config_db::ConfigDb,
    data_dir::DataDir,
    error::{Error, Result},
    extract,
    ingestion::Ingestor,
    job::{JobCoordinator, JobSnapshot, JobStatus},
    llm::{ModelHealth, OllamaClient, Summarizer},
    pipeline::Pipeline,
    record::WatchedFolder,
    registry::FolderRegistry,
    search::{Attachment, QueryEngine, SearchResponse},
    watcher::FolderWatcher,
};

const BACKEND_SETTING: &str = "backend";

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub model: ModelHealth,
    pub backend: BackendKind,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_files: u64,
    pub by_type: BTreeMap<String, u64>,
    pub search_engine: &'static str,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderRemoval {
    pub folder: PathBuf,
    pub removed_records: usize,
    pub cancelled_job: bool,
}

#[derive(Debug, Clone)]
pub struct Preview {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Pre-built parts for [`FileGuessr::with_components`].
pub struct Components {
    pub config_db: Arc<ConfigDb>,
    pub backend: Arc<dyn IndexBackend>,
    pub backend_status: BackendStatus,
    pub summarizer: Arc<dyn Summarizer>,
}

pub struct FileGuessr {
    config_db: Arc<ConfigDb>,
    registry: FolderRegistry,
    backend: Arc<dyn IndexBackend>,
    backend_status: BackendStatus,
    summarizer: Arc<dyn Summarizer>,
    pipeline: Arc<Pipeline>,
    query_engine: QueryEngine,
}

impl FileGuessr {
    /// Open the data directory, pick a backend and connect the model
    /// adapter. With `watch`, registered folders are watched for changes
    /// until the process exits.
    pub async fn open(config: Config, watch: bool) -> Result<Self> {
        let data_dir = DataDir::resolve(config.data_dir.as_deref())?;
        tracing::debug!(path = %data_dir.root().display(), "using data directory");
        let config_db = Arc::new(ConfigDb::open(&data_dir.config_db())?);
        let (backend, backend_status) =
            select_backend(&config, &data_dir.tantivy_dir()?).await?;
        let summarizer: Arc<dyn Summarizer> = Arc::new(OllamaClient::new(
            &config.ollama_url,
            &config.model,
            config.llm_timeout,
        )?);

        let fingerprint = match backend_status.kind {
            BackendKind::Embedded => BackendKind::Embedded.to_string(),
            BackendKind::Cluster => {
                format!("cluster:{}:{}", config.cluster_url, config.cluster_index)
            }
        };
        invalidate_on_backend_change(&config_db, &fingerprint)?;

        Self::with_components(
            &config,
            Components {
                config_db,
                backend,
                backend_status,
                summarizer,
            },
            watch,
        )
    }

    /// Assemble the service from existing parts. Must be called inside a
    /// tokio runtime when `watch` is set.
    pub fn with_components(config: &Config, parts: Components, watch: bool) -> Result<Self> {
        let Components {
            config_db,
            backend,
            backend_status,
            summarizer,
        } = parts;
        let scan_options = config.scan_options()?;
        let registry = FolderRegistry::new(Arc::clone(&config_db));

        let (watcher, events) = if watch {
            let (watcher, events) = FolderWatcher::start(
                config.debounce,
                Arc::clone(&config_db),
                scan_options.clone(),
            )?;
            let watcher = Arc::new(watcher);
            for folder in registry.list()? {
                if let Err(e) = watcher.watch(&folder.path) {
                    tracing::warn!(
                        folder = %folder.path.display(),
                        error = %e,
                        "cannot watch registered folder"
                    );
                }
            }
            (Some(watcher), Some(events))
        } else {
            (None, None)
        };

        let ingestor = Ingestor::new(
            Arc::clone(&backend),
            Arc::clone(&summarizer),
            Arc::clone(&config_db),
        );
        let pipeline = Arc::new(Pipeline::new(
            ingestor,
            Arc::clone(&config_db),
            JobCoordinator::new(),
            watcher,
            scan_options,
            config.worker_count(),
        ));
        if let Some(events) = events {
            tokio::spawn(Arc::clone(&pipeline).drain_changes(events));
        }

        let query_engine = QueryEngine::new(
            Arc::clone(&backend),
            Arc::clone(&summarizer),
            config.expand_timeout,
        );

        Ok(Self {
            config_db,
            registry,
            backend,
            backend_status,
            summarizer,
            pipeline,
            query_engine,
        })
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            model: self.summarizer.health().await,
            backend: self.backend_status.kind,
            degraded: self.backend_status.degraded,
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchResponse> {
        self.query_engine.search(query, None, limit).await
    }

    pub async fn search_multimodal(
        &self,
        query: &str,
        attachment: Attachment,
        limit: usize,
    ) -> Result<SearchResponse> {
        self.query_engine.search(query, Some(attachment), limit).await
    }

    /// Start a background full scan of `folder`. Returns the job id.
    pub fn start_index(&self, folder: &Path) -> Result<u64> {
        if folder.as_os_str().is_empty() {
            return Err(Error::InvalidInput("folder_path is required".into()));
        }
        self.pipeline.start_full_scan(folder)
    }

    /// Run a full scan of `folder` to completion on the current task.
    pub async fn index_folder(&self, folder: &Path) -> Result<JobStatus> {
        let (folder, handle) = self.pipeline.begin_full_scan(folder)?;
        Ok(self.pipeline.run_full_scan(&folder, handle).await)
    }

    pub fn index_status(&self) -> JobSnapshot {
        self.pipeline.coordinator().snapshot()
    }

    pub fn list_folders(&self) -> Result<Vec<WatchedFolder>> {
        self.registry.list()
    }

    /// Stop watching `folder` and delete it together with every record
    /// under it.
    ///
    /// A job targeting the folder is cancelled and awaited first. Any other
    /// active job makes the removal fail with `ConcurrentJobRejected`.
    pub async fn remove_folder(&self, folder: &Path) -> Result<FolderRemoval> {
        let folder = FolderRegistry::normalize(folder);
        let coordinator = self.pipeline.coordinator();

        let registered = self.registry.contains(&folder)?;
        let cancelled_job = coordinator.cancel_if(|kind| kind.targets(&folder));
        if !registered && !cancelled_job {
            return Err(Error::NotFound {
                kind: "folder",
                name: folder.to_string_lossy().into_owned(),
            });
        }
        if !cancelled_job && coordinator.is_active() {
            return Err(Error::ConcurrentJobRejected);
        }

        self.stop_watching(&folder);
        let _guard = coordinator.exclusive_when_idle().await;
        // A scan cancelled after it registered the folder may have
        // re-watched it.
        self.stop_watching(&folder);

        let removed_records = self.backend.delete_prefix(&folder).await?;
        let paths = self.config_db.file_paths_under(&folder)?;
        self.config_db.batch_remove_file_metadata(&paths)?;
        for nested in self.registry.list()? {
            if nested.path.starts_with(&folder) {
                self.registry.remove(&nested.path)?;
            }
        }

        tracing::info!(
            folder = %folder.display(),
            removed_records,
            cancelled_job,
            "folder removed"
        );
        Ok(FolderRemoval {
            folder,
            removed_records,
            cancelled_job,
        })
    }

    fn stop_watching(&self, folder: &Path) {
        if let Some(watcher) = self.pipeline.watcher() {
            for root in watcher.watched() {
                if root.starts_with(folder) {
                    watcher.unwatch(&root);
                }
            }
        }
        self.pipeline.discard_pending_under(folder);
    }

    /// Empty the index. Watched folders are kept.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.pipeline.coordinator().try_exclusive()?;
        self.backend.clear().await?;
        self.config_db.clear_file_metadata()?;
        tracing::info!("index cleared");
        Ok(())
    }

    /// Raw bytes of an image under a watched folder.
    pub async fn preview(&self, path: &Path) -> Result<Preview> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("path is required".into()));
        }
        let not_found = || Error::NotFound {
            kind: "file",
            name: path.to_string_lossy().into_owned(),
        };
        let canonical = tokio::fs::canonicalize(path).await.map_err(|_| not_found())?;
        if self.registry.owner_of(&canonical)?.is_none() {
            return Err(Error::PathNotWatched(canonical));
        }
        if !extract::is_image(&canonical) {
            return Err(Error::InvalidInput(
                "previews are only available for images".into(),
            ));
        }
        let bytes = tokio::fs::read(&canonical).await.map_err(|_| not_found())?;
        Ok(Preview {
            bytes,
            mime: mime_guess::from_path(&canonical)
                .first_or_octet_stream()
                .to_string(),
        })
    }

    pub async fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            total_files: self.backend.count().await?,
            by_type: self.backend.count_by_extension().await?,
            search_engine: self.backend_status.kind.engine_name(),
            degraded: self.backend_status.degraded,
        })
    }
}

impl std::fmt::Debug for FileGuessr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGuessr")
            .field("backend", &self.backend_status)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Forget per-file metadata when the index backend differs from the one
/// used last time, so the next scan fills the new backend from scratch.
fn invalidate_on_backend_change(config_db: &ConfigDb, fingerprint: &str) -> Result<()> {
    let previous = config_db.get_setting(BACKEND_SETTING)?;
    if let Some(previous) = previous.as_deref()
        && previous != fingerprint
    {
        tracing::warn!(
            previous,
            current = fingerprint,
            "index backend changed, folders will be fully re-indexed on next scan"
        );
        config_db.clear_file_metadata()?;
    }
    if previous.as_deref() != Some(fingerprint) {
        config_db.set_setting(BACKEND_SETTING, fingerprint)?;
    }
    Ok(())
}
