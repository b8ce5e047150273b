use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "FILEGUESSR_DATA_DIR";

/// Where persisted state lives:
///
/// ```text
/// <root>/config.redb   watched folders, per-file metadata, settings
/// <root>/tantivy/      embedded index (unused with the cluster backend)
/// ```
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Pick the root from `explicit`, then `FILEGUESSR_DATA_DIR`, then
    /// `$XDG_DATA_HOME/fileguessr`, creating it if needed.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(DATA_DIR_ENV_VAR) {
                Some(val) if !val.is_empty() => PathBuf::from(val),
                _ => xdg_data_home()?,
            },
        };
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    pub fn tantivy_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("tantivy");
        ensure_dir(&dir)?;
        Ok(dir)
    }
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("fileguessr")
        .get_data_home()
        .ok_or_else(|| Error::Config("could not determine XDG data home directory".into()))
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|_| Error::DataDir(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
    }

    #[test]
    fn missing_directories_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());

        let tantivy = dir.tantivy_dir().unwrap();
        assert_eq!(tantivy, nested.join("tantivy"));
        assert!(tantivy.is_dir());
    }

    #[test]
    fn file_in_the_way_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let err = DataDir::resolve(Some(&blocker.join("data"))).unwrap_err();
        assert!(matches!(err, Error::DataDir(_)));
    }
}
