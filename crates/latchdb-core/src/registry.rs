//! Caller-owned database registry
//!
//! One [`Database`] per file path, held in an explicit registry the
//! application constructs at startup and passes by reference. Nothing here
//! is process-global; two registries are two independent sets of pools.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::database::{Database, DatabaseConfig};
use crate::errors::Result;

/// Registry of open databases keyed by normalized file path.
#[derive(Default)]
pub struct PoolRegistry {
    databases: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve to an absolute, symlink-free key so two spellings of the
    /// same file share one pool.
    fn normalize(path: &Path) -> Result<PathBuf> {
        if path.exists() {
            Ok(path.canonicalize()?)
        } else {
            Ok(std::path::absolute(path)?)
        }
    }

    /// Return the existing database for `path`, or open one with `config`.
    ///
    /// When two tasks race to open the same path, the first registration
    /// wins and the loser's freshly-opened instance is shut down again.
    pub async fn get_or_open(
        &self,
        path: impl AsRef<Path>,
        config: DatabaseConfig,
    ) -> Result<Arc<Database>> {
        let key = Self::normalize(path.as_ref())?;

        if let Some(existing) = self.databases.lock().get(&key) {
            return Ok(Arc::clone(existing));
        }

        let opened = Arc::new(Database::open(&key, config).await?);

        let winner = {
            let mut map = self.databases.lock();
            match map.entry(key) {
                Entry::Occupied(entry) => {
                    debug!("lost open race, reusing existing database");
                    Some(Arc::clone(entry.get()))
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&opened));
                    None
                }
            }
        };

        match winner {
            Some(existing) => {
                opened.shutdown().await;
                Ok(existing)
            }
            None => Ok(opened),
        }
    }

    /// Look up an already-open database without opening one.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Database>> {
        let key = Self::normalize(path.as_ref()).ok()?;
        self.databases.lock().get(&key).cloned()
    }

    /// Remove a database from the registry. The instance stays usable for
    /// holders of other clones until they drop it.
    pub fn remove(&self, path: impl AsRef<Path>) -> Option<Arc<Database>> {
        let key = Self::normalize(path.as_ref()).ok()?;
        self.databases.lock().remove(&key)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.databases.lock().keys().cloned().collect()
    }

    /// Shut down and remove every registered database.
    pub async fn shutdown_all(&self) {
        let databases: Vec<Arc<Database>> = {
            let mut map = self.databases.lock();
            map.drain().map(|(_, db)| db).collect()
        };
        for db in databases {
            db.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_path_shares_one_database() {
        let dir = TempDir::new().unwrap();
        let registry = PoolRegistry::new();
        let path = dir.path().join("shared.db");

        let a = registry
            .get_or_open(&path, DatabaseConfig::default())
            .await
            .unwrap();
        let b = registry
            .get_or_open(&path, DatabaseConfig::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.paths().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_paths_get_distinct_databases() {
        let dir = TempDir::new().unwrap();
        let registry = PoolRegistry::new();

        let a = registry
            .get_or_open(dir.path().join("a.db"), DatabaseConfig::default())
            .await
            .unwrap();
        let b = registry
            .get_or_open(dir.path().join("b.db"), DatabaseConfig::default())
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_registry() {
        let dir = TempDir::new().unwrap();
        let registry = PoolRegistry::new();
        registry
            .get_or_open(dir.path().join("a.db"), DatabaseConfig::default())
            .await
            .unwrap();

        registry.shutdown_all().await;
        assert!(registry.paths().is_empty());
        assert!(registry.get(dir.path().join("a.db")).is_none());
    }
}
