use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Maximum number of characters of extracted text kept as the searchable
/// content excerpt.
pub const CONTENT_EXCERPT_CHARS: usize = 10_000;

/// One indexed file. Keyed by its absolute `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub extension: String,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch.
    pub modified_time: u64,
    pub summary: String,
    pub keywords: Vec<String>,
    pub content_hash: String,
    /// Leading slice of the extracted text. Indexed at the lowest weight,
    /// never returned to callers.
    #[serde(default, skip_serializing)]
    pub content: String,
}

impl FileRecord {
    /// Build a record skeleton from on-disk metadata. Summary, keywords and
    /// content are filled in by the pipeline.
    pub fn from_path(
        path: &Path,
        size_bytes: u64,
        modified_time: u64,
        content_hash: String,
    ) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: extension_of(path),
            size_bytes,
            modified_time,
            summary: String::new(),
            keywords: Vec::new(),
            content_hash,
            content: String::new(),
        }
    }

    pub fn with_content(mut self, text: &str) -> Self {
        self.content = text.chars().take(CONTENT_EXCERPT_CHARS).collect();
        self
    }
}

/// A record returned by an index backend with its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: FileRecord,
    pub score: f32,
}

/// A search result as returned to callers. Derived per request, never
/// stored.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: FileRecord,
    pub score: f32,
    pub matched_terms: Vec<String>,
}

/// A registered folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedFolder {
    pub path: PathBuf,
    /// Seconds since the Unix epoch of the last completed full scan, if any.
    pub last_scanned_time: Option<u64>,
}

/// Lowercased extension without the dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_unix() -> u64 {
    unix_seconds(SystemTime::now())
}

/// Ranking order shared by every backend: descending score, ties broken by
/// the most recently modified file.
pub fn sort_by_relevance(results: &mut [ScoredRecord]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.modified_time.cmp(&a.record.modified_time))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, mtime: u64) -> FileRecord {
        FileRecord::from_path(Path::new(path), 10, mtime, "h".into())
    }

    #[test]
    fn from_path_fills_name_and_extension() {
        let r = record("/docs/Budget_2024.PDF", 5);
        assert_eq!(r.name, "Budget_2024.PDF");
        assert_eq!(r.extension, "pdf");
        assert_eq!(r.path, "/docs/Budget_2024.PDF");
    }

    #[test]
    fn content_is_truncated_and_not_serialized() {
        let long = "x".repeat(CONTENT_EXCERPT_CHARS + 50);
        let r = record("/docs/a.txt", 1).with_content(&long);
        assert_eq!(r.content.chars().count(), CONTENT_EXCERPT_CHARS);

        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["name"], "a.txt");
    }

    #[test]
    fn ties_break_on_most_recent_mtime() {
        let mut results = vec![
            ScoredRecord {
                record: record("/a/old.txt", 100),
                score: 1.0,
            },
            ScoredRecord {
                record: record("/a/best.txt", 1),
                score: 3.0,
            },
            ScoredRecord {
                record: record("/a/new.txt", 200),
                score: 1.0,
            },
        ];
        sort_by_relevance(&mut results);
        let names: Vec<_> =
            results.iter().map(|r| r.record.name.as_str()).collect();
        assert_eq!(names, vec!["best.txt", "new.txt", "old.txt"]);
    }
}
