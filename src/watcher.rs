use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use notify_debouncer_mini::{
    DebounceEventResult,
    Debouncer,
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode},
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    incremental::FileMetadata,
    walker::{DiscoveredFile, ScanOptions, discover_files, is_hidden_under},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A normalized filesystem change under a watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

type Roots = Arc<Mutex<HashSet<PathBuf>>>;

fn lock_roots(roots: &Roots) -> MutexGuard<'_, HashSet<PathBuf>> {
    roots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Debounced recursive watcher over the registered folders.
///
/// Raw notifications for one path inside the debounce window collapse into
/// one event, which is classified against the stored per-file metadata and
/// sent to the channel returned by [`FolderWatcher::start`].
pub struct FolderWatcher {
    debouncer: Mutex<Debouncer<RecommendedWatcher>>,
    roots: Roots,
}

impl FolderWatcher {
    pub fn start(
        debounce: Duration,
        config_db: Arc<ConfigDb>,
        options: ScanOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let roots: Roots = Arc::default();

        let handler_roots = Arc::clone(&roots);
        let debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "file watcher error");
                    drop_missing_roots(&handler_roots);
                    return;
                }
            };

            let active: Vec<PathBuf> = drop_missing_roots(&handler_roots);
            let mut seen = HashSet::new();
            for event in events {
                if !seen.insert(event.path.clone()) {
                    continue;
                }
                for change in classify(&event.path, &active, &config_db, &options) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
        })
        .map_err(|e| Error::Config(format!("cannot start file watcher: {e}")))?;

        Ok((
            Self {
                debouncer: Mutex::new(debouncer),
                roots,
            },
            rx,
        ))
    }

    /// Begin watching `folder` recursively. Watching an already watched
    /// folder is a no-op.
    pub fn watch(&self, folder: &Path) -> Result<()> {
        if lock_roots(&self.roots).contains(folder) {
            return Ok(());
        }
        self.debouncer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watcher()
            .watch(folder, RecursiveMode::Recursive)
            .map_err(|e| Error::FolderUnreadable {
                path: folder.to_path_buf(),
                reason: e.to_string(),
            })?;
        lock_roots(&self.roots).insert(folder.to_path_buf());
        tracing::debug!(folder = %folder.display(), "watching folder");
        Ok(())
    }

    /// Stop watching `folder`. Events still pending in the debounce window
    /// for it are discarded.
    pub fn unwatch(&self, folder: &Path) {
        if !lock_roots(&self.roots).remove(folder) {
            return;
        }
        if let Err(e) = self
            .debouncer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watcher()
            .unwatch(folder)
        {
            tracing::debug!(folder = %folder.display(), error = %e, "unwatch failed");
        }
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> =
            lock_roots(&self.roots).iter().cloned().collect();
        roots.sort();
        roots
    }
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher")
            .field("roots", &self.watched())
            .finish_non_exhaustive()
    }
}

/// Remove roots that vanished from disk, warning once for each, and return
/// the ones still active.
fn drop_missing_roots(roots: &Roots) -> Vec<PathBuf> {
    let mut roots = lock_roots(roots);
    roots.retain(|root| {
        let exists = root.is_dir();
        if !exists {
            tracing::warn!(
                folder = %root.display(),
                "watched folder disappeared, no longer watching it"
            );
        }
        exists
    });
    roots.iter().cloned().collect()
}

/// Turn one debounced path into zero or more change events.
///
/// - a vanished path that was indexed becomes `Deleted`; a vanished
///   directory becomes `Deleted` for every indexed file below it
/// - an eligible file becomes `Created` (never indexed) or `Modified`
///   (stored mtime/size differ); unchanged files produce nothing
/// - a new directory (e.g. moved in) is walked for eligible files
pub fn classify(
    path: &Path,
    roots: &[PathBuf],
    config_db: &ConfigDb,
    options: &ScanOptions,
) -> Vec<ChangeEvent> {
    let Some(root) = roots.iter().find(|r| path.starts_with(r)) else {
        return Vec::new();
    };
    if path == root.as_path() || is_hidden_under(root, path) {
        return Vec::new();
    }

    let key = path.to_string_lossy();
    let stored = match config_db.get_file_metadata(&key) {
        Ok(stored) => stored.and_then(|b| FileMetadata::deserialize(&b)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "metadata lookup failed");
            None
        }
    };

    if !path.exists() {
        if stored.is_some() {
            return vec![deleted(path)];
        }
        return config_db
            .file_paths_under(path)
            .unwrap_or_default()
            .into_iter()
            .map(|p| deleted(Path::new(&p)))
            .collect();
    }

    if path.is_dir() {
        if options.is_excluded(path) {
            return Vec::new();
        }
        return discover_files(path, options)
            .unwrap_or_default()
            .into_iter()
            .filter(|f| !is_hidden_under(root, &f.path))
            .filter_map(|f| file_change(f, config_db))
            .collect();
    }

    match DiscoveredFile::stat(path, options) {
        Some(file) => file_change_with(file, stored).into_iter().collect(),
        // No longer eligible (e.g. grew past the size limit) but indexed.
        None if stored.is_some() => vec![deleted(path)],
        None => Vec::new(),
    }
}

fn deleted(path: &Path) -> ChangeEvent {
    ChangeEvent {
        path: path.to_path_buf(),
        kind: ChangeKind::Deleted,
    }
}

fn file_change(file: DiscoveredFile, config_db: &ConfigDb) -> Option<ChangeEvent> {
    let stored = config_db
        .get_file_metadata(&file.path.to_string_lossy())
        .ok()
        .flatten()
        .and_then(|b| FileMetadata::deserialize(&b));
    file_change_with(file, stored)
}

fn file_change_with(
    file: DiscoveredFile,
    stored: Option<FileMetadata>,
) -> Option<ChangeEvent> {
    let kind = match stored {
        None => ChangeKind::Created,
        Some(meta) if meta != FileMetadata::of(&file) => ChangeKind::Modified,
        Some(_) => return None,
    };
    Some(ChangeEvent {
        path: file.path,
        kind,
    })
}

/// Changes waiting for the job coordinator, coalesced per path.
///
/// Later changes for a path replace earlier ones but keep its place in the
/// queue.
#[derive(Debug, Default)]
pub struct PendingChanges {
    order: VecDeque<PathBuf>,
    latest: HashMap<PathBuf, ChangeKind>,
}

impl PendingChanges {
    pub fn push(&mut self, event: ChangeEvent) {
        if self.latest.insert(event.path.clone(), event.kind).is_none() {
            self.order.push_back(event.path);
        }
    }

    /// Put a change back at the front, e.g. after the coordinator rejected
    /// it. A newer change for the same path wins.
    pub fn push_front(&mut self, event: ChangeEvent) {
        if !self.latest.contains_key(&event.path) {
            self.latest.insert(event.path.clone(), event.kind);
            self.order.push_front(event.path);
        }
    }

    pub fn pop(&mut self) -> Option<ChangeEvent> {
        while let Some(path) = self.order.pop_front() {
            if let Some(kind) = self.latest.remove(&path) {
                return Some(ChangeEvent { path, kind });
            }
        }
        None
    }

    /// Drop every pending change under `folder`.
    pub fn discard_under(&mut self, folder: &Path) {
        self.latest.retain(|path, _| !path.starts_with(folder));
        self.order.retain(|path| !path.starts_with(folder));
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incremental::{store_metadata, store_retry_marker};

    fn setup() -> (tempfile::TempDir, PathBuf, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        let root = tmp.path().join("docs");
        std::fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();
        (tmp, root, db)
    }

    fn kinds(events: &[ChangeEvent]) -> Vec<ChangeKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn new_file_is_created() {
        let (_tmp, root, db) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let events =
            classify(&path, &[root.clone()], &db, &ScanOptions::default());
        assert_eq!(kinds(&events), vec![ChangeKind::Created]);
    }

    #[test]
    fn changed_file_is_modified_and_unchanged_is_skipped() {
        let (_tmp, root, db) = setup();
        let path = root.join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let file = DiscoveredFile::stat(&path, &ScanOptions::default()).unwrap();
        store_metadata(&db, &file).unwrap();

        let roots = [root.clone()];
        assert!(classify(&path, &roots, &db, &ScanOptions::default()).is_empty());

        std::fs::write(&path, "hello, longer now").unwrap();
        let events = classify(&path, &roots, &db, &ScanOptions::default());
        assert_eq!(kinds(&events), vec![ChangeKind::Modified]);
    }

    #[test]
    fn removed_file_is_deleted() {
        let (_tmp, root, db) = setup();
        let path = root.join("gone.txt");
        db.set_file_metadata(&path.to_string_lossy(), b"1\x002").unwrap();

        let events =
            classify(&path, &[root.clone()], &db, &ScanOptions::default());
        assert_eq!(kinds(&events), vec![ChangeKind::Deleted]);
    }

    #[test]
    fn file_awaiting_summary_is_retried_then_deleted() {
        let (_tmp, root, db) = setup();
        let path = root.join("holiday-plan.txt");
        std::fs::write(&path, "ideas").unwrap();
        let file = DiscoveredFile::stat(&path, &ScanOptions::default()).unwrap();
        store_retry_marker(&db, &file).unwrap();

        let roots = [root.clone()];
        let events = classify(&path, &roots, &db, &ScanOptions::default());
        assert_eq!(kinds(&events), vec![ChangeKind::Modified]);

        std::fs::remove_file(&path).unwrap();
        let events = classify(&path, &roots, &db, &ScanOptions::default());
        assert_eq!(kinds(&events), vec![ChangeKind::Deleted]);
    }

    #[test]
    fn removed_directory_deletes_known_children() {
        let (_tmp, root, db) = setup();
        let sub = root.join("sub");
        db.set_file_metadata(&sub.join("a.txt").to_string_lossy(), b"1\x002")
            .unwrap();
        db.set_file_metadata(&sub.join("b.txt").to_string_lossy(), b"1\x002")
            .unwrap();

        let events =
            classify(&sub, &[root.clone()], &db, &ScanOptions::default());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Deleted));
    }

    #[test]
    fn moved_in_directory_is_walked() {
        let (_tmp, root, db) = setup();
        let sub = root.join("incoming");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("a.md"), "a").unwrap();
        std::fs::write(sub.join("skip.exe"), "b").unwrap();

        let events =
            classify(&sub, &[root.clone()], &db, &ScanOptions::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, sub.join("a.md"));
    }

    #[test]
    fn ignores_unwatched_hidden_and_unsupported() {
        let (tmp, root, db) = setup();
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, "x").unwrap();
        let hidden = root.join(".secret.txt");
        std::fs::write(&hidden, "x").unwrap();
        let binary = root.join("tool.exe");
        std::fs::write(&binary, "x").unwrap();

        let roots = [root.clone()];
        let options = ScanOptions::default();
        assert!(classify(&outside, &roots, &db, &options).is_empty());
        assert!(classify(&hidden, &roots, &db, &options).is_empty());
        assert!(classify(&binary, &roots, &db, &options).is_empty());
        assert!(classify(&root, &roots, &db, &options).is_empty());
    }

    #[test]
    fn pending_changes_coalesce_per_path() {
        let mut pending = PendingChanges::default();
        let ev = |p: &str, kind| ChangeEvent {
            path: PathBuf::from(p),
            kind,
        };
        pending.push(ev("/d/a", ChangeKind::Created));
        pending.push(ev("/d/b", ChangeKind::Modified));
        pending.push(ev("/d/a", ChangeKind::Deleted));
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.pop(), Some(ev("/d/a", ChangeKind::Deleted)));
        pending.push_front(ev("/d/a", ChangeKind::Deleted));
        pending.push(ev("/e/c", ChangeKind::Created));
        pending.discard_under(Path::new("/d"));

        assert_eq!(pending.pop(), Some(ev("/e/c", ChangeKind::Created)));
        assert_eq!(pending.pop(), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn push_front_does_not_override_newer_change() {
        let mut pending = PendingChanges::default();
        pending.push(ChangeEvent {
            path: "/d/a".into(),
            kind: ChangeKind::Deleted,
        });
        pending.push_front(ChangeEvent {
            path: "/d/a".into(),
            kind: ChangeKind::Created,
        });
        assert_eq!(pending.pop().unwrap().kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn emits_debounced_events() {
        let (tmp, root, db) = setup();
        let db = Arc::new(db);
        let (watcher, mut rx) = FolderWatcher::start(
            Duration::from_millis(100),
            Arc::clone(&db),
            ScanOptions::default(),
        )
        .unwrap();
        watcher.watch(&root).unwrap();
        assert_eq!(watcher.watched(), vec![root.clone()]);

        std::fs::write(root.join("new.txt"), "fresh").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, root.join("new.txt"));
        assert_eq!(event.kind, ChangeKind::Created);

        watcher.unwatch(&root);
        assert!(watcher.watched().is_empty());
        drop(tmp);
    }

    #[test]
    fn watching_missing_folder_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(ConfigDb::open(&tmp.path().join("c.redb")).unwrap());
        let (watcher, _rx) = FolderWatcher::start(
            Duration::from_millis(100),
            db,
            ScanOptions::default(),
        )
        .unwrap();
        let err = watcher.watch(Path::new("/definitely/missing")).unwrap_err();
        assert_eq!(err.kind(), "folder_unreadable");
    }
}
