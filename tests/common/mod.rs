#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier::core::plan::DownloadOptions;
use courier::core::{PlanOptions, RetryPolicy, Scheduler, Throttle, TransferPlan, UnitSelector};
use courier::remote::{MessageRef, SimulatedService};
use courier::storage::{Namespace, SqliteStorage, Storage};

pub const CHAT: i64 = 1;

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_flood_retries: 3,
    }
}

pub async fn namespace(name: &str) -> Arc<dyn Namespace> {
    let storage = SqliteStorage::open_in_memory().await.unwrap();
    storage.open(name).await.unwrap()
}

/// `count` media messages in [`CHAT`], each `size` bytes.
pub fn seeded(count: usize, size: usize) -> Arc<SimulatedService> {
    let sim = Arc::new(SimulatedService::new());
    seed(&sim, count, size);
    sim
}

pub fn seed(sim: &SimulatedService, count: usize, size: usize) {
    for i in 0..count {
        let content = courier::remote::simulated::sample_content(i as i64, size);
        sim.add_media_message(
            CHAT,
            &format!("file{i}.bin"),
            "application/octet-stream",
            content,
            None,
        );
    }
}

pub fn scheduler(sim: Arc<SimulatedService>, ns: Arc<dyn Namespace>) -> Scheduler {
    Scheduler::new(sim, Throttle::new(), ns, fast_policy())
}

pub fn download_plan(
    dir: &Path,
    ids: std::ops::RangeInclusive<i32>,
    chunk_size: u32,
) -> TransferPlan {
    let mut opts = DownloadOptions::new(dir);
    opts.chunk_size = chunk_size;
    TransferPlan::new(
        UnitSelector::Messages(ids.map(|id| MessageRef::new(CHAT, id)).collect()),
        PlanOptions::Download(opts),
    )
}
