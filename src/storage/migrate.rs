//! One-shot import of a legacy namespace into the current backend.
//!
//! Gated by two marker keys in the target namespace. `started` is written
//! before the first key is copied and `done` after the last; copying is an
//! upsert, so a run interrupted anywhere in between simply copies everything
//! again on the next attempt and converges to the same key set.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Namespace, Storage, keys};
use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The done marker was already present.
    AlreadyDone,
    /// Nothing to import.
    NoLegacyData,
    /// The current backend already held data for this namespace; legacy data
    /// was left alone and the namespace marked as migrated.
    CurrentDataPresent,
    Migrated { keys: usize },
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    at: String,
    keys: usize,
}

fn marker(keys: usize) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(&Marker {
        at: Utc::now().to_rfc3339(),
        keys,
    })?)
}

fn failed(namespace: &str, err: StorageError) -> StorageError {
    StorageError::Migration {
        namespace: namespace.to_string(),
        reason: err.to_string(),
    }
}

async fn user_keys(ns: &dyn Namespace) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    let mut entries = ns.scan_prefix("").await?;
    entries.retain(|(k, _)| !keys::is_meta(k));
    Ok(entries)
}

pub async fn migrate_namespace(
    legacy: &dyn Storage,
    current: &dyn Storage,
    namespace: &str,
) -> Result<MigrationOutcome, StorageError> {
    let target = current.open(namespace).await?;

    if target.contains(keys::MIGRATION_DONE).await? {
        // Crash between writing `done` and clearing `started`.
        if target.contains(keys::MIGRATION_STARTED).await? {
            target.delete(keys::MIGRATION_STARTED).await?;
        }
        return Ok(MigrationOutcome::AlreadyDone);
    }

    let source = legacy.open(namespace).await?;
    let entries = user_keys(source.as_ref()).await?;
    if entries.is_empty() {
        return Ok(MigrationOutcome::NoLegacyData);
    }

    let resuming = target.contains(keys::MIGRATION_STARTED).await?;
    if !resuming && !user_keys(target.as_ref()).await?.is_empty() {
        warn!(
            namespace,
            legacy_keys = entries.len(),
            "Current store already has data; legacy data not imported"
        );
        target.set(keys::MIGRATION_DONE, &marker(0)?).await?;
        return Ok(MigrationOutcome::CurrentDataPresent);
    }

    if resuming {
        warn!(namespace, "Resuming interrupted legacy import");
    }

    let total = entries.len();
    let copy = async {
        target
            .set(keys::MIGRATION_STARTED, &marker(total)?)
            .await?;
        for (key, value) in &entries {
            target.set(key, value).await?;
        }
        target.set(keys::MIGRATION_DONE, &marker(total)?).await?;
        target.delete(keys::MIGRATION_STARTED).await?;
        Ok::<(), StorageError>(())
    };
    copy.await.map_err(|e| failed(namespace, e))?;

    info!(namespace, keys = total, "Legacy namespace imported");
    Ok(MigrationOutcome::Migrated { keys: total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LegacyStorage, SqliteStorage};

    async fn seeded_legacy(dir: &std::path::Path) -> LegacyStorage {
        let legacy = LegacyStorage::new(dir);
        let ns = legacy.open("acct").await.unwrap();
        ns.set("session:desktop", b"blob").await.unwrap();
        ns.set("dedup:download:aa", b"{}").await.unwrap();
        legacy
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = seeded_legacy(dir.path()).await;
        let current = SqliteStorage::open_in_memory().await.unwrap();

        let first = migrate_namespace(&legacy, &current, "acct").await.unwrap();
        assert_eq!(first, MigrationOutcome::Migrated { keys: 2 });

        let second = migrate_namespace(&legacy, &current, "acct").await.unwrap();
        assert_eq!(second, MigrationOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn existing_current_data_wins() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = seeded_legacy(dir.path()).await;
        let current = SqliteStorage::open_in_memory().await.unwrap();
        let ns = current.open("acct").await.unwrap();
        ns.set("session:desktop", b"newer").await.unwrap();

        let outcome = migrate_namespace(&legacy, &current, "acct").await.unwrap();
        assert_eq!(outcome, MigrationOutcome::CurrentDataPresent);
        assert_eq!(ns.get("session:desktop").await.unwrap(), b"newer");
        assert!(ns.get_opt("dedup:download:aa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_legacy_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyStorage::new(dir.path());
        let current = SqliteStorage::open_in_memory().await.unwrap();

        let outcome = migrate_namespace(&legacy, &current, "acct").await.unwrap();
        assert_eq!(outcome, MigrationOutcome::NoLegacyData);
        assert!(current.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_started_marker_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = seeded_legacy(dir.path()).await;
        let current = SqliteStorage::open_in_memory().await.unwrap();
        migrate_namespace(&legacy, &current, "acct").await.unwrap();

        let ns = current.open("acct").await.unwrap();
        ns.set(keys::MIGRATION_STARTED, b"{}").await.unwrap();
        migrate_namespace(&legacy, &current, "acct").await.unwrap();
        assert!(!ns.contains(keys::MIGRATION_STARTED).await.unwrap());
    }
}
