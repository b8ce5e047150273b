use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{config_db::ConfigDb, error::Result, record::WatchedFolder};

/// The persisted set of watched folders.
///
/// Folder paths are stored canonicalized when the folder exists, so the
/// component-wise ownership check lines up with the absolute paths the
/// walker produces.
#[derive(Debug, Clone)]
pub struct FolderRegistry {
    db: Arc<ConfigDb>,
}

impl FolderRegistry {
    pub fn new(db: Arc<ConfigDb>) -> Self {
        Self { db }
    }

    /// Canonical form of a folder path. Falls back to the path as given
    /// when it no longer exists on disk (e.g. removing a deleted folder).
    pub fn normalize(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    /// Register a folder. Returns false if it was already registered.
    pub fn add(&self, folder: &Path) -> Result<bool> {
        self.db.add_folder(&folder.to_string_lossy())
    }

    pub fn remove(&self, folder: &Path) -> Result<bool> {
        self.db.remove_folder(&folder.to_string_lossy())
    }

    pub fn contains(&self, folder: &Path) -> Result<bool> {
        Ok(self.db.get_folder(&folder.to_string_lossy())?.is_some())
    }

    pub fn mark_scanned(&self, folder: &Path, when: u64) -> Result<()> {
        self.db.set_folder_scanned(&folder.to_string_lossy(), when)
    }

    pub fn list(&self) -> Result<Vec<WatchedFolder>> {
        Ok(self
            .db
            .list_folders()?
            .into_iter()
            .map(|(path, scanned)| WatchedFolder {
                path: PathBuf::from(path),
                last_scanned_time: (scanned > 0).then_some(scanned),
            })
            .collect())
    }

    /// The registered folder that owns `path`, if any. When folders nest,
    /// the deepest one wins.
    pub fn owner_of(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|f| f.path)
            .filter(|folder| path.starts_with(folder))
            .max_by_key(|folder| folder.components().count()))
    }
}
