use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCVAULT_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The DOCVAULT_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docvault/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docvault")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    /// Directory holding every artifact of one collection. Not created.
    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join("collections").join(name)
    }

    pub fn index_file(&self, name: &str) -> PathBuf {
        self.collection_dir(name).join("index.redb")
    }

    /// Audit trail of the raw documents that went into a collection.
    pub fn audit_dir(&self, name: &str) -> PathBuf {
        self.collection_dir(name).join("json")
    }

    pub fn lock_file(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join("locks");
        std::fs::create_dir_all(&dir)
            .map_err(|_| Error::DataDir(dir.clone()))?;
        Ok(dir.join(format!("{name}.lock")))
    }

    pub fn models_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("models");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}

/// Collection names become directory and file names, so keep them boring.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid collection name '{name}': use letters, digits, '-', '_' or '.'"
        )))
    }
}
