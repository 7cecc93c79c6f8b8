//! Namespaced key-value storage.
//!
//! Two backends implement [`Storage`]: [`SqliteStorage`], the default
//! single-file store, and [`LegacyStorage`], the old directory-of-files layout
//! that is only read to import existing data. [`StorageManager`] fronts both
//! and runs the one-shot legacy import before a namespace is first served.

pub mod keys;
pub mod legacy;
pub mod migrate;
pub mod sqlite;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;

pub use legacy::LegacyStorage;
pub use migrate::{MigrationOutcome, migrate_namespace};
pub use sqlite::SqliteStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Legacy,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Legacy => "legacy",
        }
    }
}

/// One isolated partition of a store.
///
/// Every call is its own transaction; there is no cross-key atomicity.
#[async_trait]
pub trait Namespace: Send + Sync {
    fn name(&self) -> &str;

    /// Returns [`StorageError::NotFound`] when the key is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Returns [`StorageError::NotFound`] when the key is absent.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_opt(key).await?.is_some())
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Open (creating if needed) a namespace.
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError>;

    /// Names of every namespace that holds data, sorted.
    async fn namespaces(&self) -> Result<Vec<String>, StorageError>;

    /// Drop a namespace and all of its keys. Returns whether it existed.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError>;
}

pub async fn get_json<T: DeserializeOwned>(
    ns: &dyn Namespace,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match ns.get_opt(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    ns: &dyn Namespace,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    ns.set(key, &bytes).await
}

/// Namespace names double as directory names in the legacy layout.
pub fn validate_namespace(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidNamespace(name.to_string()))
    }
}

/// Where the stores live on disk.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    pub path: PathBuf,
    pub legacy_dir: Option<PathBuf>,
}

/// Entry point for all storage access.
///
/// Serves namespaces from the current backend, importing legacy data into it
/// the first time each namespace is opened.
pub struct StorageManager {
    current: Arc<dyn Storage>,
    legacy: Option<Arc<dyn Storage>>,
    migrated: Mutex<HashSet<String>>,
}

impl StorageManager {
    pub fn new(current: Arc<dyn Storage>, legacy: Option<Arc<dyn Storage>>) -> Self {
        Self {
            current,
            legacy,
            migrated: Mutex::new(HashSet::new()),
        }
    }

    /// SQLite file at `location.path`, plus the legacy directory if one exists.
    pub async fn from_location(location: &StorageLocation) -> Result<Self, StorageError> {
        let current: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&location.path).await?);

        let legacy = match &location.legacy_dir {
            Some(dir) if dir.is_dir() => {
                debug!(dir = %dir.display(), "Legacy store detected");
                Some(Arc::new(LegacyStorage::new(dir)) as Arc<dyn Storage>)
            }
            _ => None,
        };

        Ok(Self::new(current, legacy))
    }

    pub fn current(&self) -> &Arc<dyn Storage> {
        &self.current
    }

    pub fn has_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    /// Open a namespace, importing its legacy data first if that has not
    /// happened yet in this process.
    pub async fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        validate_namespace(namespace)?;

        {
            let mut migrated = self.migrated.lock().await;
            if !migrated.contains(namespace) {
                if let Some(legacy) = &self.legacy {
                    migrate_namespace(legacy.as_ref(), self.current.as_ref(), namespace).await?;
                }
                migrated.insert(namespace.to_string());
            }
        }

        self.current.open(namespace).await
    }

    /// Import every legacy namespace. Safe to call repeatedly.
    pub async fn migrate_all(&self) -> Result<Vec<(String, MigrationOutcome)>, StorageError> {
        let Some(legacy) = &self.legacy else {
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::new();
        let mut migrated = self.migrated.lock().await;
        for namespace in legacy.namespaces().await? {
            let outcome =
                migrate_namespace(legacy.as_ref(), self.current.as_ref(), &namespace).await?;
            migrated.insert(namespace.clone());
            outcomes.push((namespace, outcome));
        }
        info!(count = outcomes.len(), "Legacy namespaces checked");
        Ok(outcomes)
    }

    /// Namespaces known to either backend.
    pub async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.current.namespaces().await?;
        if let Some(legacy) = &self.legacy {
            names.extend(legacy.namespaces().await?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Delete a namespace from both backends, so that it is not re-imported.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        validate_namespace(namespace)?;

        let mut migrated = self.migrated.lock().await;
        let mut existed = self.current.delete_namespace(namespace).await?;
        if let Some(legacy) = &self.legacy {
            existed |= legacy.delete_namespace(namespace).await?;
        }
        migrated.remove(namespace);

        if existed {
            info!(namespace, "Namespace deleted");
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("namespace {namespace}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_names_are_validated() {
        assert!(validate_namespace("default").is_ok());
        assert!(validate_namespace("acct_42.backup").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("../etc").is_err());
        assert!(validate_namespace(".hidden").is_err());
        assert!(validate_namespace("a/b").is_err());
    }

    #[tokio::test]
    async fn json_helpers_round_trip_and_report_absence() {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let ns = storage.open("default").await.unwrap();

        assert_eq!(get_json::<Vec<u32>>(ns.as_ref(), "k").await.unwrap(), None);
        set_json(ns.as_ref(), "k", &vec![1u32, 2, 3]).await.unwrap();
        assert_eq!(
            get_json::<Vec<u32>>(ns.as_ref(), "k").await.unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn manager_imports_legacy_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyStorage::new(dir.path().join("legacy"));
        let old = legacy.open("acct").await.unwrap();
        old.set("session:desktop", b"blob").await.unwrap();

        let current: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let manager = StorageManager::new(current, Some(Arc::new(legacy)));

        let ns = manager.open("acct").await.unwrap();
        assert_eq!(ns.get("session:desktop").await.unwrap(), b"blob");
        assert!(ns.contains(keys::MIGRATION_DONE).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_namespace_removes_it_from_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = Arc::new(LegacyStorage::new(dir.path().join("legacy")));
        legacy.open("acct").await.unwrap().set("k", b"v").await.unwrap();

        let current: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let manager = StorageManager::new(current, Some(legacy.clone()));
        manager.open("acct").await.unwrap();

        manager.delete_namespace("acct").await.unwrap();
        assert!(manager.namespaces().await.unwrap().is_empty());

        let err = manager.delete_namespace("acct").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
