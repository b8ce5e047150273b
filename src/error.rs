use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("cannot open database: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("cannot extract {}: {message}", path.display())]
    Extraction { path: PathBuf, message: String },

    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("language model timed out after {0}s")]
    ModelTimeout(u64),

    #[error("index backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("an indexing job is already running")]
    ConcurrentJobRejected,

    #[error("folder unreadable: {}: {reason}", path.display())]
    FolderUnreadable { path: PathBuf, reason: String },

    #[error("path is not inside a watched folder: {}", .0.display())]
    PathNotWatched(PathBuf),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Stable category name reported to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidQuery(_) => "invalid_query",
            Error::InvalidInput(_) => "invalid_input",
            Error::Extraction { .. } => "extraction_error",
            Error::ModelUnavailable(_) => "model_unavailable",
            Error::ModelTimeout(_) => "model_timeout",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::ConcurrentJobRejected => "concurrent_job_rejected",
            Error::FolderUnreadable { .. } => "folder_unreadable",
            Error::PathNotWatched(_) => "path_not_watched",
            Error::NotFound { .. } => "not_found",
            Error::Config(_) | Error::DataDir(_) => "config",
            Error::Io(_)
            | Error::Redb(_)
            | Error::RedbDatabase(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_)
            | Error::Tantivy(_)
            | Error::Json(_)
            | Error::Join(_) => "internal",
        }
    }

    /// Errors raised by the model adapter. Indexing degrades on these
    /// instead of skipping the file.
    pub fn is_model_error(&self) -> bool {
        matches!(self, Error::ModelUnavailable(_) | Error::ModelTimeout(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::BackendUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_distinguish_taxonomy() {
        assert_eq!(
            Error::InvalidQuery("empty".into()).kind(),
            "invalid_query"
        );
        assert_eq!(Error::ConcurrentJobRejected.kind(), "concurrent_job_rejected");
        assert_eq!(Error::ModelTimeout(5).kind(), "model_timeout");
        assert_eq!(
            Error::FolderUnreadable {
                path: "/nope".into(),
                reason: "missing".into()
            }
            .kind(),
            "folder_unreadable"
        );
    }

    #[test]
    fn model_errors_are_flagged() {
        assert!(Error::ModelTimeout(1).is_model_error());
        assert!(Error::ModelUnavailable("down".into()).is_model_error());
        assert!(!Error::BackendUnavailable("down".into()).is_model_error());
    }

    #[test]
    fn display_includes_path() {
        let e = Error::Extraction {
            path: "/docs/broken.pdf".into(),
            message: "bad xref".into(),
        };
        assert_eq!(e.to_string(), "cannot extract /docs/broken.pdf: bad xref");
    }
}
