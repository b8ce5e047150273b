use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    cluster_index::ClusterIndex,
    config::{BackendChoice, Config},
    error::Result,
    record::{FileRecord, ScoredRecord},
    tantivy_index::EmbeddedIndex,
};

/// Concrete storage engine behind an [`IndexBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Embedded,
    Cluster,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Cluster => "cluster",
        }
    }

    /// Display name of the engine, as reported by `/stats`.
    pub fn engine_name(self) -> &'static str {
        match self {
            BackendKind::Embedded => "tantivy",
            BackendKind::Cluster => "elasticsearch",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend the process runs with, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    /// True when the cluster was wanted but unreachable.
    pub degraded: bool,
}

/// Full-text store for [`FileRecord`]s.
///
/// Implementations must be safe for concurrent searches and upserts. Both
/// return results in descending score order, ties broken by the most
/// recently modified file.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert or replace the record stored under `record.path`.
    async fn upsert(&self, record: &FileRecord) -> Result<()>;

    /// Remove the record for `path`. Missing paths are not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Remove every record whose path lies under `folder` (per component).
    /// Returns the number of records removed.
    async fn delete_prefix(&self, folder: &Path) -> Result<usize>;

    /// Ranked fuzzy search over name, keywords, summary and content.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredRecord>>;

    /// Remove every record.
    async fn clear(&self) -> Result<()>;

    async fn count(&self) -> Result<u64>;

    /// Record counts keyed by extension.
    async fn count_by_extension(&self) -> Result<BTreeMap<String, u64>>;
}

/// Pick the backend for this process.
///
/// `Embedded` never probes. `Auto` and `Cluster` probe the cluster once and
/// fall back to the embedded index, flagged as degraded, when it cannot be
/// reached.
pub async fn select_backend(
    config: &Config,
    tantivy_dir: &Path,
) -> Result<(Arc<dyn IndexBackend>, BackendStatus)> {
    if config.backend != BackendChoice::Embedded {
        match ClusterIndex::connect(
            &config.cluster_url,
            &config.cluster_index,
            config.cluster_probe_timeout,
        )
        .await
        {
            Ok(cluster) => {
                tracing::info!(url = %config.cluster_url, "using cluster index backend");
                let status = BackendStatus {
                    kind: BackendKind::Cluster,
                    degraded: false,
                };
                return Ok((Arc::new(cluster), status));
            }
            Err(e) if config.backend == BackendChoice::Cluster => {
                tracing::error!(
                    url = %config.cluster_url,
                    error = %e,
                    "cluster backend unreachable, running degraded on the embedded index"
                );
            }
            Err(e) => {
                tracing::warn!(
                    url = %config.cluster_url,
                    error = %e,
                    "cluster backend unreachable, running degraded on the embedded index"
                );
            }
        }
        let embedded = EmbeddedIndex::open(tantivy_dir)?;
        return Ok((
            Arc::new(embedded),
            BackendStatus {
                kind: BackendKind::Embedded,
                degraded: true,
            },
        ));
    }

    let embedded = EmbeddedIndex::open(tantivy_dir)?;
    Ok((
        Arc::new(embedded),
        BackendStatus {
            kind: BackendKind::Embedded,
            degraded: false,
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn embedded_choice_skips_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            backend: BackendChoice::Embedded,
            ..Config::default()
        };
        let (backend, status) = select_backend(&config, tmp.path()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Embedded);
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn unreachable_cluster_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            backend: BackendChoice::Auto,
            cluster_url: "http://127.0.0.1:9".into(),
            cluster_probe_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        let (backend, status) = select_backend(&config, tmp.path()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Embedded);
        assert_eq!(
            status,
            BackendStatus {
                kind: BackendKind::Embedded,
                degraded: true
            }
        );
    }

    #[test]
    fn kind_names() {
        assert_eq!(BackendKind::Cluster.to_string(), "cluster");
        assert_eq!(BackendKind::Embedded.engine_name(), "tantivy");
    }
}
