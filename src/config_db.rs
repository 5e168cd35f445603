use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use redb::{
    Database,
    DatabaseError,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
};

use crate::{error::Result, vector_index::CollectionManifest};

/// Collection name -> JSON-encoded [`CollectionManifest`].
const COLLECTIONS: TableDefinition<&str, &str> =
    TableDefinition::new("collections");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// How long an operation waits for another process to close the database.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const OPEN_RETRY: Duration = Duration::from_millis(25);

/// Settings and the collection registry.
///
/// redb locks the whole file while a `Database` is open, so the handle
/// only keeps the path and every operation opens the database for the
/// length of one transaction. Long builds and queries in other processes
/// never hold it.
pub struct ConfigDb {
    path: PathBuf,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        let config_db = Self {
            path: path.to_path_buf(),
        };

        // Ensure all tables exist by opening them in a write transaction.
        let db = config_db.connect()?;
        let txn = db.begin_write()?;
        txn.open_table(COLLECTIONS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(config_db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the database, waiting while another process has it open.
    fn connect(&self) -> Result<Database> {
        let deadline = Instant::now() + OPEN_TIMEOUT;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen)
                    if Instant::now() < deadline =>
                {
                    std::thread::sleep(OPEN_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -- Collections --

    pub fn set_collection(&self, manifest: &CollectionManifest) -> Result<()> {
        let encoded = serde_json::to_string(manifest)?;
        let db = self.connect()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(COLLECTIONS)?;
            table.insert(manifest.name.as_str(), encoded.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionManifest>> {
        let db = self.connect()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(COLLECTIONS)?;
        let Some(guard) = table.get(name)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(guard.value())?))
    }

    pub fn remove_collection(&self, name: &str) -> Result<bool> {
        let db = self.connect()?;
        let txn = db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(COLLECTIONS)?;
            table.remove(name)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// All registered collections, ordered by name.
    pub fn list_collections(&self) -> Result<Vec<CollectionManifest>> {
        let db = self.connect()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(COLLECTIONS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_str(v.value())?);
        }
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let db = self.connect()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let db = self.connect()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let db = self.connect()?;
        let txn = db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let db = self.connect()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb")
            .field("path", &self.path)
            .finish()
    }
}
