use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::{config_db::ConfigDb, error::Result, walker::DiscoveredFile};

/// Staleness metadata stored per indexed file in config.redb.
///
/// Serialized as: `"mtime\0size"`, with a trailing `"\0retry"` for files
/// that were indexed without a model summary.
///
/// # Examples
///
/// ```
/// use fileguessr::incremental::FileMetadata;
///
/// let meta = FileMetadata { mtime: 1700000000, size: 42, needs_retry: false };
/// let bytes = meta.serialize();
/// assert_eq!(FileMetadata::deserialize(&bytes), Some(meta));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub mtime: u64,
    pub size: u64,
    /// The record exists but lacks a summary. Never equal to the metadata of
    /// a file on disk, so the file is treated as changed until it succeeds.
    pub needs_retry: bool,
}

const RETRY_MARKER: &str = "retry";

impl FileMetadata {
    pub fn of(file: &DiscoveredFile) -> Self {
        Self {
            mtime: file.mtime,
            size: file.size,
            needs_retry: false,
        }
    }

    /// Serialize to a byte vector for storage in the config database.
    pub fn serialize(&self) -> Vec<u8> {
        if self.needs_retry {
            format!("{}\0{}\0{RETRY_MARKER}", self.mtime, self.size).into_bytes()
        } else {
            format!("{}\0{}", self.mtime, self.size).into_bytes()
        }
    }

    /// Deserialize from bytes. Returns `None` if the format is invalid.
    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(bytes).ok()?;
        let mut parts = s.split('\0');
        let mtime = parts.next()?.parse().ok()?;
        let size = parts.next()?.parse().ok()?;
        let needs_retry = match parts.next() {
            None => false,
            Some(RETRY_MARKER) => true,
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            mtime,
            size,
            needs_retry,
        })
    }
}

/// Result of comparing discovered files against stored metadata.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Files that are new (not in metadata).
    pub new_files: Vec<DiscoveredFile>,
    /// Files that have changed (mtime or size differs).
    pub changed_files: Vec<DiscoveredFile>,
    /// Files whose metadata matches; no work needed.
    pub unchanged_files: Vec<DiscoveredFile>,
    /// Paths that were in metadata under the folder but are no longer on disk.
    pub deleted_paths: Vec<String>,
}

impl DiffResult {
    pub fn needs_processing(&self) -> usize {
        self.new_files.len() + self.changed_files.len()
    }
}

/// Compare the files discovered under `folder` against stored metadata.
pub fn diff_folder(
    config_db: &ConfigDb,
    folder: &Path,
    discovered: &[DiscoveredFile],
) -> Result<DiffResult> {
    let mut known: HashMap<String, FileMetadata> = HashMap::new();
    for (path, bytes) in config_db.list_all_file_metadata()? {
        if Path::new(&path).starts_with(folder)
            && let Some(meta) = FileMetadata::deserialize(&bytes)
        {
            known.insert(path, meta);
        }
    }

    let mut result = DiffResult::default();
    let mut seen = HashSet::new();

    for file in discovered {
        let path = file.path.to_string_lossy().to_string();
        match known.get(&path) {
            None => result.new_files.push(file.clone()),
            Some(stored) if *stored != FileMetadata::of(file) => {
                result.changed_files.push(file.clone());
            }
            Some(_) => result.unchanged_files.push(file.clone()),
        }
        seen.insert(path);
    }

    result.deleted_paths = known
        .into_keys()
        .filter(|path| !seen.contains(path))
        .collect();
    result.deleted_paths.sort();

    Ok(result)
}

/// Store metadata for a file after it was fully indexed.
pub fn store_metadata(config_db: &ConfigDb, file: &DiscoveredFile) -> Result<()> {
    config_db.set_file_metadata(
        &file.path.to_string_lossy(),
        &FileMetadata::of(file).serialize(),
    )
}

/// Record a file that is in the index but still needs a model summary.
///
/// The next scan or change event sees it as changed and retries it, and a
/// deletion still finds it.
pub fn store_retry_marker(config_db: &ConfigDb, file: &DiscoveredFile) -> Result<()> {
    let meta = FileMetadata {
        needs_retry: true,
        ..FileMetadata::of(file)
    };
    config_db.set_file_metadata(&file.path.to_string_lossy(), &meta.serialize())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    fn make_file(path: &str, mtime: u64) -> DiscoveredFile {
        DiscoveredFile {
            path: PathBuf::from(path),
            mtime,
            size: 10,
        }
    }

    #[test]
    fn rejects_malformed_metadata() {
        assert_eq!(FileMetadata::deserialize(b"12"), None);
        assert_eq!(FileMetadata::deserialize(b"a\x00b"), None);
        assert_eq!(FileMetadata::deserialize(b"1\x002\x00later"), None);
    }

    #[test]
    fn retry_marker_counts_as_changed_and_as_known() {
        let (_tmp, db) = test_db();
        let file = make_file("/docs/a.md", 100);
        store_retry_marker(&db, &file).unwrap();

        let diff = diff_folder(&db, Path::new("/docs"), &[file]).unwrap();
        assert_eq!(diff.changed_files.len(), 1);
        assert!(diff.unchanged_files.is_empty());

        let diff = diff_folder(&db, Path::new("/docs"), &[]).unwrap();
        assert_eq!(diff.deleted_paths, vec!["/docs/a.md".to_string()]);
    }

    #[test]
    fn all_new_files() {
        let (_tmp, db) = test_db();
        let files = vec![make_file("/docs/a.md", 100), make_file("/docs/b.md", 200)];
        let diff = diff_folder(&db, Path::new("/docs"), &files).unwrap();

        assert_eq!(diff.new_files.len(), 2);
        assert_eq!(diff.needs_processing(), 2);
        assert!(diff.changed_files.is_empty());
        assert!(diff.deleted_paths.is_empty());
    }

    #[test]
    fn unchanged_files() {
        let (_tmp, db) = test_db();
        let file = make_file("/docs/a.md", 100);
        store_metadata(&db, &file).unwrap();

        let diff = diff_folder(&db, Path::new("/docs"), &[file]).unwrap();
        assert!(diff.new_files.is_empty());
        assert!(diff.changed_files.is_empty());
        assert_eq!(diff.unchanged_files.len(), 1);
    }

    #[test]
    fn changed_file_detected() {
        let (_tmp, db) = test_db();
        store_metadata(&db, &make_file("/docs/a.md", 100)).unwrap();

        let diff = diff_folder(&db, Path::new("/docs"), &[make_file("/docs/a.md", 200)])
            .unwrap();
        assert_eq!(diff.changed_files.len(), 1);
        assert!(diff.unchanged_files.is_empty());
    }

    #[test]
    fn deleted_file_detected() {
        let (_tmp, db) = test_db();
        store_metadata(&db, &make_file("/docs/a.md", 100)).unwrap();

        let diff = diff_folder(&db, Path::new("/docs"), &[]).unwrap();
        assert_eq!(diff.deleted_paths, vec!["/docs/a.md".to_string()]);
    }

    #[test]
    fn ignores_sibling_folders() {
        let (_tmp, db) = test_db();
        store_metadata(&db, &make_file("/docs2/a.md", 100)).unwrap();

        let diff = diff_folder(&db, Path::new("/docs"), &[]).unwrap();
        assert!(diff.deleted_paths.is_empty());
    }
}
