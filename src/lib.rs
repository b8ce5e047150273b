//! fileguessr - find local files by describing them.
//!
//! fileguessr scans watched folders, asks a local language model (through
//! [Ollama](https://ollama.com)) to summarize each document or caption each
//! image, and keeps the results in a fuzzy full-text index: an embedded
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index, or an
//! Elasticsearch cluster when one is reachable. Queries are expanded by the
//! same model and may carry an attached file whose description is folded
//! into the search.
//!
//! # Quick start
//!
//! ```no_run
//! use fileguessr::{Config, FileGuessr};
//!
//! # async fn run() -> fileguessr::Result<()> {
//! let service = FileGuessr::open(Config::default(), false).await?;
//! service.index_folder(std::path::Path::new("/home/me/Documents")).await?;
//!
//! let response = service.search("receipt for the new laptop", 10).await?;
//! for hit in &response.results {
//!     println!("{} (score: {:.3})", hit.record.path, hit.score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cluster_index;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod doc_id;
pub mod error;
pub mod extract;
pub mod incremental;
pub mod ingestion;
pub mod job;
pub mod llm;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod search;
pub mod server;
pub mod service;
pub mod tantivy_index;
pub mod text_util;
pub mod walker;
pub mod watcher;

pub use backend::{BackendKind, BackendStatus, IndexBackend};
pub use config::Config;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use llm::{OllamaClient, Summarizer};
pub use record::{FileRecord, SearchHit, WatchedFolder};
pub use service::FileGuessr;
pub use tantivy_index::SearchIndex;
