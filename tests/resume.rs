mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CHAT, download_plan, namespace, scheduler, seeded};
use courier::core::plan::DownloadOptions;
use courier::core::{
    Category, PlanOptions, ResumeStore, SchedulerEvent, SkipReason, TransferPlan, UnitOutcome,
    UnitSelector,
};
use courier::remote::{MessageRef, SimulatedService, endpoint};
use courier::storage::{SqliteStorage, Storage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn completed_plan_reruns_without_transfer_calls() {
    let dir = tempfile::tempdir().unwrap();
    let sim = seeded(3, 10_000);
    let ns = namespace("acct").await;
    let plan = download_plan(dir.path(), 1..=3, 4096);

    let first = scheduler(sim.clone(), ns.clone())
        .run(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.done, 3);
    let fetched = sim.calls_to(endpoint::GET_FILE);
    assert_eq!(fetched, 9);

    let second = scheduler(sim.clone(), ns)
        .run(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.skipped, 3);
    assert_eq!(second.done, 0);
    assert_eq!(sim.calls_to(endpoint::GET_FILE), fetched);
}

#[tokio::test]
async fn interrupted_download_resumes_to_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(SimulatedService::new().with_latency(Duration::from_millis(5)));
    common::seed(&sim, 1, 64 * 1024);
    let expected = sim.file_content(1).unwrap();
    let ns = namespace("acct").await;

    let mut plan = download_plan(dir.path(), 1..=1, 4096);
    plan.concurrency = 1;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SchedulerEvent::Progress(p) = event {
                if p.bytes_transferred >= 16 * 1024 {
                    trigger.cancel();
                }
            }
        }
    });

    let interrupted = scheduler(sim.clone(), ns.clone()).with_events(tx);
    let summary = interrupted.run(&plan, &cancel).await.unwrap();
    drop(interrupted);
    watcher.await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.done, 0);
    let dest = dir.path().join("1_1_file0.bin");
    assert!(!dest.exists());
    let first_calls = sim.calls_to(endpoint::GET_FILE);
    assert!(first_calls < 16, "{first_calls} chunks fetched before cancel");

    plan.resume = true;
    let resumed = scheduler(sim.clone(), ns)
        .run(&plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.done, 1);
    assert!(resumed.bytes < expected.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), expected);
    assert!(sim.calls_to(endpoint::GET_FILE) - first_calls < 16);
}

#[tokio::test]
async fn skip_same_touches_no_file_data() {
    let dir = tempfile::tempdir().unwrap();
    let sim = seeded(1, 5000);
    // Same size, different bytes: still skipped, only the size is compared.
    std::fs::write(dir.path().join("1_1_file0.bin"), vec![0u8; 5000]).unwrap();

    let mut opts = DownloadOptions::new(dir.path());
    opts.skip_same = true;
    opts.chunk_size = 4096;
    let plan = TransferPlan::new(
        UnitSelector::Messages(vec![MessageRef::new(CHAT, 1)]),
        PlanOptions::Download(opts),
    );

    let (tx, mut rx) = mpsc::channel(16);
    let s = scheduler(sim.clone(), namespace("acct").await).with_events(tx);
    let summary = s.run(&plan, &CancellationToken::new()).await.unwrap();
    drop(s);

    assert_eq!(summary.skipped, 1);
    assert_eq!(sim.calls_to(endpoint::GET_FILE), 0);
    let mut reasons = Vec::new();
    while let Some(event) = rx.recv().await {
        if let SchedulerEvent::Finished { outcome, .. } = event {
            reasons.push(outcome);
        }
    }
    assert_eq!(reasons, vec![UnitOutcome::skipped(SkipReason::SameFileExists)]);
}

#[tokio::test]
async fn dedup_tables_are_per_namespace_and_category() {
    let storage = SqliteStorage::open_in_memory().await.unwrap();
    let work = storage.open("work").await.unwrap();
    let home = storage.open("home").await.unwrap();
    let sim = seeded(1, 100);

    let dir = tempfile::tempdir().unwrap();
    let done = scheduler(sim.clone(), work.clone())
        .run(&download_plan(dir.path(), 1..=1, 4096), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(done.done, 1);

    // The other account has no history for the same message.
    let other_dir = tempfile::tempdir().unwrap();
    let again = scheduler(sim.clone(), home)
        .run(
            &download_plan(other_dir.path(), 1..=1, 4096),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(again.done, 1);
    assert_eq!(sim.calls_to(endpoint::GET_FILE), 2);

    let store = ResumeStore::new(work);
    assert_eq!(store.counts(Category::Download).await.unwrap().done, 1);
    assert_eq!(store.counts(Category::Upload).await.unwrap().done, 0);
    assert_eq!(store.counts(Category::Forward).await.unwrap().done, 0);
}
