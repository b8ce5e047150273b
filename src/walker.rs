use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::{
    error::{Error, Result},
    extract,
    record::unix_seconds,
};

/// Directory names skipped unless the caller overrides the exclude list.
pub const DEFAULT_EXCLUDES: &[&str] =
    &["**/node_modules", "**/target", "**/__pycache__", "**/.git"];

/// Files larger than this are skipped by default (50 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// A candidate file found under a watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Fully resolved absolute path.
    pub path: PathBuf,
    /// Last modification time as seconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
}

impl DiscoveredFile {
    /// Stat a single path. Returns `None` when the path is not an eligible
    /// regular file.
    pub fn stat(path: &Path, options: &ScanOptions) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() || !options.accepts(path, meta.len()) {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            mtime: meta.modified().map(unix_seconds).unwrap_or(0),
            size: meta.len(),
        })
    }
}

/// Filters applied while walking.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    excludes: GlobSet,
    pub max_file_size: u64,
}

impl ScanOptions {
    pub fn new(excludes: &[String], max_file_size: u64) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excludes {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Config(format!("invalid exclude glob {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| Error::Config(format!("invalid exclude set: {e}")))?;
        Ok(Self {
            excludes,
            max_file_size,
        })
    }

    /// Whether the path, or any directory above it, matches an exclude glob.
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.ancestors().any(|p| self.excludes.is_match(p))
    }

    /// Whether a file with this path and size should be indexed.
    pub fn accepts(&self, path: &Path, size: u64) -> bool {
        size <= self.max_file_size
            && extract::is_supported(path)
            && !self.is_excluded(path)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        let excludes: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        // The default patterns are static and known to be valid.
        Self::new(&excludes, DEFAULT_MAX_FILE_SIZE).unwrap_or(Self {
            excludes: GlobSet::empty(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        })
    }
}

/// Whether any component of `path` below `root` is hidden.
pub fn is_hidden_under(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root).is_ok_and(|rel| {
        rel.components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    })
}

/// Recursively walk a folder and return every eligible file.
///
/// Skips hidden files/directories (names starting with `.`), excluded
/// directories, unsupported extensions, and files over the size limit. The
/// root itself must be readable; unreadable subdirectories are logged and
/// skipped.
pub fn discover_files(
    root: &Path,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root =
        root.canonicalize().map_err(|e| Error::FolderUnreadable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
    let entries =
        std::fs::read_dir(&canonical_root).map_err(|e| {
            Error::FolderUnreadable {
                path: canonical_root.clone(),
                reason: e.to_string(),
            }
        })?;

    let mut results = Vec::new();
    walk_entries(entries, options, &mut results);
    results.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(results)
}

fn walk_dir(current: &Path, options: &ScanOptions, results: &mut Vec<DiscoveredFile>) {
    match std::fs::read_dir(current) {
        Ok(entries) => walk_entries(entries, options, results),
        Err(e) => {
            tracing::warn!(
                path = %current.display(),
                error = %e,
                "skipping unreadable directory"
            );
        }
    }
}

fn walk_entries(
    entries: std::fs::ReadDir,
    options: &ScanOptions,
    results: &mut Vec<DiscoveredFile>,
) {
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            if !options.is_excluded(&path) {
                walk_dir(&path, options, results);
            }
        } else if let Some(file) = DiscoveredFile::stat(&path, options) {
            // Symlinks are stat'ed through to their target but keep the
            // link path, so the record stays under the watched folder.
            // Links to directories are never followed.
            results.push(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(files: &[DiscoveredFile], root: &Path) -> Vec<String> {
        let root = root.canonicalize().unwrap();
        files
            .iter()
            .map(|f| {
                f.path
                    .strip_prefix(&root)
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn discovers_supported_types() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("budget.pdf"), "%PDF").unwrap();
        std::fs::write(tmp.path().join("cat.png"), "png").unwrap();
        std::fs::write(tmp.path().join("app.exe"), "binary").unwrap();

        let files = discover_files(tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(
            names(&files, tmp.path()),
            vec!["budget.pdf", "cat.png", "note.md"]
        );
        assert!(files.iter().all(|f| f.path.is_absolute()));
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        let git = tmp.path().join(".git");
        std::fs::create_dir(&git).unwrap();
        std::fs::write(git.join("config.md"), "git").unwrap();
        std::fs::write(tmp.path().join("visible.md"), "hello").unwrap();

        let files = discover_files(tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(names(&files, tmp.path()), vec!["visible.md"]);
    }

    #[test]
    fn skips_excluded_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = tmp.path().join("node_modules").join("pkg");
        std::fs::create_dir_all(&deps).unwrap();
        std::fs::write(deps.join("readme.md"), "dep").unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("deep.md"), "deep").unwrap();

        let files = discover_files(tmp.path(), &ScanOptions::default()).unwrap();
        assert_eq!(names(&files, tmp.path()), vec!["sub/deep.md"]);
    }

    #[test]
    fn custom_excludes_and_size_limit() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), "small").unwrap();
        std::fs::write(tmp.path().join("draft.txt"), "small").unwrap();
        std::fs::write(tmp.path().join("big.txt"), "x".repeat(100)).unwrap();

        let options = ScanOptions::new(&["**/draft.*".to_string()], 50).unwrap();
        let files = discover_files(tmp.path(), &options).unwrap();
        assert_eq!(names(&files, tmp.path()), vec!["keep.txt"]);
    }

    #[test]
    fn hidden_check_is_relative_to_root() {
        let root = Path::new("/home/u/.config/docs");
        assert!(!is_hidden_under(root, &root.join("a.md")));
        assert!(is_hidden_under(root, &root.join(".cache/a.md")));
        assert!(!is_hidden_under(root, Path::new("/elsewhere/.x")));
    }

    #[test]
    fn excluded_ancestors_match() {
        let options = ScanOptions::default();
        assert!(options.is_excluded(Path::new("/p/node_modules/pkg/a.md")));
        assert!(!options.is_excluded(Path::new("/p/src/a.md")));
    }

    #[test]
    fn invalid_glob_is_config_error() {
        let err = ScanOptions::new(&["a[".to_string()], 10).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn missing_root_is_unreadable() {
        let err = discover_files(
            Path::new("/definitely/not/here"),
            &ScanOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "folder_unreadable");
    }

    #[test]
    fn stat_reports_size_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.md");
        std::fs::write(&path, "content").unwrap();

        let file = DiscoveredFile::stat(&path, &ScanOptions::default()).unwrap();
        assert_eq!(file.size, 7);
        assert!(file.mtime > 0);
    }
}
