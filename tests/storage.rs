use courier::storage::{
    LegacyStorage, MigrationOutcome, Namespace, Storage, StorageLocation, StorageManager, keys,
};

async fn user_keys(ns: &dyn Namespace) -> Vec<(String, Vec<u8>)> {
    let mut entries = ns.scan_prefix("").await.unwrap();
    entries.retain(|(k, _)| !keys::is_meta(k));
    entries
}

async fn seed_legacy(dir: &std::path::Path) {
    let legacy = LegacyStorage::new(dir);
    for (ns, n) in [("alice", 3), ("bob", 2)] {
        let ns = legacy.open(ns).await.unwrap();
        ns.set("session:desktop", format!("blob-{n}").as_bytes())
            .await
            .unwrap();
        for i in 0..n {
            ns.set(&format!("dedup:download:{i:02x}"), b"{\"state\":\"done\"}")
                .await
                .unwrap();
        }
    }
}

fn location(dir: &std::path::Path) -> StorageLocation {
    StorageLocation {
        path: dir.join("data.db"),
        legacy_dir: Some(dir.join("legacy")),
    }
}

#[tokio::test]
async fn migration_is_idempotent_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    seed_legacy(&dir.path().join("legacy")).await;

    let manager = StorageManager::from_location(&location(dir.path()))
        .await
        .unwrap();
    let mut first = manager.migrate_all().await.unwrap();
    first.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        first,
        vec![
            ("alice".to_string(), MigrationOutcome::Migrated { keys: 4 }),
            ("bob".to_string(), MigrationOutcome::Migrated { keys: 3 }),
        ]
    );
    let before = user_keys(manager.open("alice").await.unwrap().as_ref()).await;
    drop(manager);

    // A new process sees the same data and imports nothing twice.
    let manager = StorageManager::from_location(&location(dir.path()))
        .await
        .unwrap();
    let second = manager.migrate_all().await.unwrap();
    assert!(
        second
            .iter()
            .all(|(_, outcome)| *outcome == MigrationOutcome::AlreadyDone)
    );
    let after = user_keys(manager.open("alice").await.unwrap().as_ref()).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn interrupted_import_completes_on_next_open() {
    let dir = tempfile::tempdir().unwrap();
    seed_legacy(&dir.path().join("legacy")).await;

    // What a crash after copying one key leaves behind.
    let current = courier::storage::SqliteStorage::open(&dir.path().join("data.db"))
        .await
        .unwrap();
    let partial = current.open("alice").await.unwrap();
    partial.set(keys::MIGRATION_STARTED, b"{}").await.unwrap();
    partial.set("session:desktop", b"blob-3").await.unwrap();
    drop(partial);
    drop(current);

    let manager = StorageManager::from_location(&location(dir.path()))
        .await
        .unwrap();
    let ns = manager.open("alice").await.unwrap();

    assert_eq!(user_keys(ns.as_ref()).await.len(), 4);
    assert!(ns.contains(keys::MIGRATION_DONE).await.unwrap());
    assert!(!ns.contains(keys::MIGRATION_STARTED).await.unwrap());
}

#[tokio::test]
async fn namespaces_list_both_backends_until_deleted() {
    let dir = tempfile::tempdir().unwrap();
    seed_legacy(&dir.path().join("legacy")).await;
    let manager = StorageManager::from_location(&location(dir.path()))
        .await
        .unwrap();

    manager.open("carol").await.unwrap().set("k", b"v").await.unwrap();
    assert_eq!(
        manager.namespaces().await.unwrap(),
        vec!["alice", "bob", "carol"]
    );

    manager.delete_namespace("bob").await.unwrap();
    assert_eq!(manager.namespaces().await.unwrap(), vec!["alice", "carol"]);
}
