use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::Result;

/// Folder path -> last full scan time (unix seconds, 0 = never).
const WATCHED_FOLDERS: TableDefinition<&str, u64> =
    TableDefinition::new("watched_folders");
/// Absolute file path -> serialized `FileMetadata`.
const FILE_METADATA: TableDefinition<&str, &[u8]> =
    TableDefinition::new("file_metadata");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

pub struct ConfigDb {
    db: Database,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(WATCHED_FOLDERS)?;
        txn.open_table(FILE_METADATA)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Watched folders --

    /// Register a folder. Returns false if it was already registered, in
    /// which case its scan time is left untouched.
    pub fn add_folder(&self, path: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let added = {
            let mut table = txn.open_table(WATCHED_FOLDERS)?;
            if table.get(path)?.is_some() {
                false
            } else {
                table.insert(path, 0u64)?;
                true
            }
        };
        txn.commit()?;
        Ok(added)
    }

    pub fn set_folder_scanned(&self, path: &str, when: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(WATCHED_FOLDERS)?;
            table.insert(path, when)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_folder(&self, path: &str) -> Result<Option<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(WATCHED_FOLDERS)?;
        Ok(table.get(path)?.map(|v| v.value()))
    }

    pub fn remove_folder(&self, path: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(WATCHED_FOLDERS)?;
            table.remove(path)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_folders(&self) -> Result<Vec<(String, u64)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(WATCHED_FOLDERS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value()));
        }
        Ok(result)
    }

    // -- File metadata --

    pub fn set_file_metadata(&self, path: &str, data: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_METADATA)?;
            table.insert(path, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_file_metadata(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_METADATA)?;
        Ok(table.get(path)?.map(|v| v.value().to_vec()))
    }

    pub fn remove_file_metadata(&self, path: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(FILE_METADATA)?;
            table.remove(path)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Remove multiple file metadata entries in a single transaction.
    pub fn batch_remove_file_metadata(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FILE_METADATA)?;
            for path in paths {
                table.remove(path.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Return all (path, metadata_bytes) pairs in a single read transaction.
    pub fn list_all_file_metadata(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_METADATA)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(result)
    }

    /// Paths of every file with stored metadata that lives under `folder`.
    pub fn file_paths_under(&self, folder: &Path) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILE_METADATA)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            let path = k.value();
            if Path::new(path).starts_with(folder) {
                result.push(path.to_string());
            }
        }
        Ok(result)
    }

    pub fn clear_file_metadata(&self) -> Result<()> {
        let paths: Vec<String> = self
            .list_all_file_metadata()?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        self.batch_remove_file_metadata(&paths)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}
