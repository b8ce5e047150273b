//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fileguessr::{
    BackendKind,
    BackendStatus,
    Config,
    ConfigDb,
    FileGuessr,
    SearchIndex,
    Summarizer,
    error::{Error, Result},
    llm::{ModelHealth, Summary},
    service::Components,
    tantivy_index::EmbeddedIndex,
};

/// Deterministic model stand-in: summaries repeat the first words of the
/// text, captions describe every image as a pet photo.
#[derive(Default)]
pub struct StubSummarizer {
    pub fail: AtomicBool,
    pub hang: AtomicBool,
}

impl StubSummarizer {
    async fn gate(&self) -> Result<()> {
        while self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ModelUnavailable("stub offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, file_name: &str, text: &str) -> Result<Summary> {
        self.gate().await?;
        let words: Vec<String> = text
            .split_whitespace()
            .take(8)
            .map(str::to_lowercase)
            .collect();
        Ok(Summary {
            summary: format!("Document {file_name}: {}", words.join(" ")),
            keywords: words,
        })
    }

    async fn caption(&self, file_name: &str, _image: &[u8]) -> Result<Summary> {
        self.gate().await?;
        Ok(Summary {
            summary: format!("A picture named {file_name}"),
            keywords: vec!["animal".into(), "pet".into(), "photo".into()],
        })
    }

    async fn expand(&self, query: &str) -> Result<String> {
        self.gate().await?;
        Ok(format!("{query} related"))
    }

    async fn health(&self) -> ModelHealth {
        ModelHealth {
            llm_running: true,
            model_available: true,
            available_models: vec!["stub:latest".into()],
            required_model: "stub".into(),
            error: None,
        }
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}

pub struct TestApp {
    pub tmp: tempfile::TempDir,
    pub docs: PathBuf,
    pub stub: Arc<StubSummarizer>,
    pub service: Arc<FileGuessr>,
}

impl TestApp {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let docs = root.join("docs");
        std::fs::create_dir(&docs).unwrap();

        let config = Config {
            data_dir: Some(root.join("data")),
            workers: 2,
            ..Config::default()
        };
        let config_db = Arc::new(ConfigDb::open(&root.join("config.redb")).unwrap());
        let stub = Arc::new(StubSummarizer::default());
        let service = FileGuessr::with_components(
            &config,
            Components {
                config_db,
                backend: Arc::new(EmbeddedIndex::new(SearchIndex::open_in_ram().unwrap())),
                backend_status: BackendStatus {
                    kind: BackendKind::Embedded,
                    degraded: false,
                },
                summarizer: Arc::clone(&stub) as Arc<dyn Summarizer>,
            },
            false,
        )
        .unwrap();

        Self {
            tmp,
            docs,
            stub,
            service: Arc::new(service),
        }
    }

    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.docs.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// The `/docs` scenario: a budget document and a cat picture.
    pub fn write_budget_and_cat(&self) {
        self.write(
            "budget_2024.md",
            "Planning notes for the quarterly budget review",
        );
        self.write("cat.png", [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.service.index_status().is_indexing {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("indexing did not finish");
    }
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
