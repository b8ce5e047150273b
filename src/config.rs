use std::{path::PathBuf, time::Duration};

use crate::{
    error::Result,
    walker::{DEFAULT_EXCLUDES, DEFAULT_MAX_FILE_SIZE, ScanOptions},
};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "gemma3:4b";
pub const DEFAULT_CLUSTER_URL: &str = "http://localhost:9200";
pub const DEFAULT_CLUSTER_INDEX: &str = "file_guessr";
pub const DEFAULT_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;

/// Which index backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendChoice {
    /// Probe the cluster and fall back to the embedded index.
    #[default]
    Auto,
    /// Always use the embedded index.
    Embedded,
    /// Prefer the cluster; fall back (degraded) if it is unreachable.
    Cluster,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit data directory; `None` resolves through `DataDir`.
    pub data_dir: Option<PathBuf>,
    pub ollama_url: String,
    pub model: String,
    pub backend: BackendChoice,
    pub cluster_url: String,
    pub cluster_index: String,
    pub workers: usize,
    pub debounce: Duration,
    pub llm_timeout: Duration,
    pub expand_timeout: Duration,
    pub cluster_probe_timeout: Duration,
    pub max_file_size: u64,
    pub excludes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            backend: BackendChoice::Auto,
            cluster_url: DEFAULT_CLUSTER_URL.to_string(),
            cluster_index: DEFAULT_CLUSTER_INDEX.to_string(),
            workers: DEFAULT_WORKERS,
            debounce: Duration::from_millis(1500),
            llm_timeout: Duration::from_secs(120),
            expand_timeout: Duration::from_secs(20),
            cluster_probe_timeout: Duration::from_secs(2),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Worker pool size, clamped to a range the local model can serve.
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn scan_options(&self) -> Result<ScanOptions> {
        ScanOptions::new(&self.excludes, self.max_file_size)
    }
}
