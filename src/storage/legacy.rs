//! The old directory-of-files layout: `<root>/<namespace>/<hex(key)>`.
//!
//! Kept so existing installations can be imported into SQLite. Writes go to
//! a temporary file that is renamed into place, so a crash never leaves a
//! half-written value behind.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use super::{BackendKind, Namespace, Storage, validate_namespace};
use crate::error::StorageError;

const TMP_SUFFIX: &str = ".tmp";

pub struct LegacyStorage {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LegacyStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Readers share, writers exclude, per namespace.
    fn lock_for(&self, namespace: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

fn not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[async_trait]
impl Storage for LegacyStorage {
    fn backend(&self) -> BackendKind {
        BackendKind::Legacy
    }

    async fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        validate_namespace(namespace)?;
        Ok(Arc::new(LegacyNamespace {
            dir: self.root.join(namespace),
            name: namespace.to_string(),
            lock: self.lock_for(namespace),
        }))
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_namespace(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError> {
        validate_namespace(namespace)?;
        let lock = self.lock_for(namespace);
        let _guard = lock.write().await;

        match fs::remove_dir_all(self.root.join(namespace)).await {
            Ok(()) => Ok(true),
            Err(e) if not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

struct LegacyNamespace {
    dir: PathBuf,
    name: String,
    lock: Arc<RwLock<()>>,
}

impl LegacyNamespace {
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key.as_bytes()))
    }
}

fn decode_key(file_name: &str) -> Option<String> {
    if file_name.ends_with(TMP_SUFFIX) {
        return None;
    }
    let bytes = hex::decode(file_name).ok()?;
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl Namespace for LegacyNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let _guard = self.lock.read().await;
        match fs::read(self.path_for(key)).await {
            Ok(value) => Ok(value),
            Err(e) if not_found(&e) => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let _guard = self.lock.read().await;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(decode_key) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            out.push((key, fs::read(entry.path()).await?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
