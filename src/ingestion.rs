use std::{path::Path, sync::Arc};

use crate::{
    backend::IndexBackend,
    config_db::ConfigDb,
    doc_id::content_hash,
    error::{Error, Result},
    extract::{self, Extracted},
    incremental::{store_metadata, store_retry_marker},
    llm::{Summarizer, Summary},
    record::FileRecord,
    walker::DiscoveredFile,
};

/// What happened to a single file.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Indexed with a model summary; staleness metadata recorded.
    Indexed,
    /// Indexed by name and content only because the model failed. The
    /// stored metadata is a retry marker, so the next scan retries the file.
    IndexedWithoutModel(Error),
}

/// Turns discovered files into index records.
#[derive(Clone)]
pub struct Ingestor {
    backend: Arc<dyn IndexBackend>,
    summarizer: Arc<dyn Summarizer>,
    config_db: Arc<ConfigDb>,
}

impl Ingestor {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        summarizer: Arc<dyn Summarizer>,
        config_db: Arc<ConfigDb>,
    ) -> Self {
        Self {
            backend,
            summarizer,
            config_db,
        }
    }

    /// Extract, describe and upsert one file.
    ///
    /// Extraction and backend failures are returned as errors and leave the
    /// index untouched for that file.
    pub async fn ingest(&self, file: &DiscoveredFile) -> Result<IngestOutcome> {
        let path = file.path.clone();
        let (hash, extracted) = tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(&path).map_err(|e| Error::Extraction {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let hash = content_hash(&bytes);
            let extracted = extract::extract_bytes(&path, &bytes)?;
            Ok::<_, Error>((hash, extracted))
        })
        .await??;

        let record = FileRecord::from_path(&file.path, file.size, file.mtime, hash);
        let described = describe(self.summarizer.as_ref(), &record.name, &extracted).await;

        let mut record = match &extracted {
            Extracted::Text(text) => record.with_content(text),
            Extracted::Image { .. } => record,
        };

        match described {
            Ok(summary) => {
                record.summary = summary.summary;
                record.keywords = summary.keywords;
                self.backend.upsert(&record).await?;
                store_metadata(&self.config_db, file)?;
                Ok(IngestOutcome::Indexed)
            }
            Err(e) if e.is_model_error() => {
                tracing::warn!(
                    path = %file.path.display(),
                    error = %e,
                    "model failed, indexing without summary"
                );
                self.backend.upsert(&record).await?;
                store_retry_marker(&self.config_db, file)?;
                Ok(IngestOutcome::IndexedWithoutModel(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a file from the index and forget its metadata.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let key = path.to_string_lossy();
        self.backend.delete(&key).await?;
        self.config_db.remove_file_metadata(&key)?;
        Ok(())
    }

    /// Drop a batch of vanished paths.
    pub async fn remove_all(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.backend.delete(path).await?;
        }
        self.config_db.batch_remove_file_metadata(paths)
    }
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("backend", &self.backend.kind())
            .field("model", &self.summarizer.model_name())
            .finish_non_exhaustive()
    }
}

/// Ask the model for a summary of extracted content. Images are captioned,
/// everything else is summarized from text.
pub async fn describe(
    summarizer: &dyn Summarizer,
    file_name: &str,
    extracted: &Extracted,
) -> Result<Summary> {
    match extracted {
        Extracted::Image { bytes, .. } => summarizer.caption(file_name, bytes).await,
        Extracted::Text(text) => summarizer.summarize(file_name, text).await,
    }
}
