//! Runs a [`TransferPlan`] over a bounded worker pool.
//!
//! The calling task expands the plan lazily and dispatches units, in plan
//! order, into a bounded queue. `concurrency` workers pull from it. Every
//! unit in flight holds a permit of the run's semaphore; listing calls and
//! chunk sub-transfers draw on the same semaphore, so the number of remote
//! operations in flight never exceeds the configured pool size.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::fingerprint::fingerprint;
use super::middleware::recovery::panic_message;
use super::middleware::{Chain, RetryLedger, RetryPolicy};
use super::models::{Category, RunSummary, SchedulerEvent, SkipReason, UnitOutcome, WorkUnit};
use super::plan::{TransferPlan, expand};
use super::progress::{EventSink, ProgressTracker};
use super::resume::{PartialState, ResumeStore, UnitStatus};
use super::throttle::Throttle;
use super::transfer_engine::{EngineContext, TransferEngine, UnitRun, engine_for};
use crate::error::TransferError;
use crate::logging::LogThrottle;
use crate::remote::RemoteService;
use crate::storage::Namespace;

/// Largest batch the remote accepts in one forward call.
pub const MAX_BATCH: usize = 100;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

struct Indexed {
    index: usize,
    unit: WorkUnit,
}

enum Job {
    Single(Indexed),
    Batch(Vec<Indexed>),
}

/// A unit whose store lookup has been done and which still needs work.
struct Pending {
    index: usize,
    unit: WorkUnit,
    fingerprint: String,
    name: String,
    resume_from: Option<PartialState>,
}

/// Whether two forward units can share one remote call.
fn batchable(a: &WorkUnit, b: &WorkUnit) -> bool {
    match (a, b) {
        (WorkUnit::Forward(a), WorkUnit::Forward(b)) => {
            a.source.chat_id == b.source.chat_id && a.target == b.target
        }
        _ => false,
    }
}

pub struct Scheduler {
    service: Arc<dyn RemoteService>,
    throttle: Throttle,
    store: ResumeStore,
    policy: RetryPolicy,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    tracker: Option<ProgressTracker>,
}

impl Scheduler {
    /// `throttle` is the session's shared cooldown state; `namespace` holds
    /// the account's dedup tables.
    pub fn new(
        service: Arc<dyn RemoteService>,
        throttle: Throttle,
        namespace: Arc<dyn Namespace>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            throttle,
            store: ResumeStore::new(namespace),
            policy,
            events: None,
            tracker: None,
        }
    }

    /// Deliver unit lifecycle and progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn store(&self) -> &ResumeStore {
        &self.store
    }

    /// Execute `plan` until every unit reached a terminal state, `cancel`
    /// fired, or the session was invalidated.
    ///
    /// A fatal session error aborts the whole run and is returned as the
    /// error; every other failure is reported per unit in the summary.
    pub async fn run(
        &self,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, TransferError> {
        plan.validate()
            .map_err(|e| TransferError::permanent(e.to_string()))?;

        let span = info_span!(
            "transfer_run",
            run_id = %Uuid::now_v7(),
            category = %plan.category(),
            concurrency = plan.concurrency,
        );
        self.execute(plan, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        plan: &TransferPlan,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, TransferError> {
        let started = Instant::now();
        let category = plan.category();

        if plan.restart {
            let removed = self.store.clear(category).await?;
            info!(removed, "Cleared {} history before restart", category);
        }

        // Fatal errors cancel this run only, never the caller's token.
        let run_cancel = cancel.child_token();
        let permits = Arc::new(Semaphore::new(plan.concurrency));
        let shared = Arc::new(RunShared {
            ctx: EngineContext {
                service: Arc::clone(&self.service),
                chain: Chain::new(self.throttle.clone(), self.policy.clone(), run_cancel.clone()),
                store: self.store.clone(),
                permits: Arc::clone(&permits),
                events: EventSink::new(self.events.clone(), self.tracker.clone()),
                chunk_log: LogThrottle::new(PROGRESS_LOG_INTERVAL),
            },
            engine: engine_for(&plan.options),
            resume: plan.resume,
            summary: Mutex::new(RunSummary::new(category)),
            fatal: Mutex::new(None),
        });

        info!(resume = plan.resume, group = plan.grouping(), "Starting transfer run");

        let (tx, rx) = mpsc::channel::<Job>(plan.concurrency);
        let rx = Arc::new(AsyncMutex::new(rx));
        let mut workers = JoinSet::new();
        for worker in 0..plan.concurrency {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            workers.spawn(
                async move { shared.work(rx).await }
                    .instrument(info_span!("worker", id = worker)),
            );
        }

        self.dispatch(plan, &shared, &permits, tx).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        if let Some(err) = shared.take_fatal() {
            error!(error = %err, "Run aborted");
            return Err(err);
        }

        let mut summary = shared.summary();
        summary.elapsed = started.elapsed();
        summary.cancelled = run_cancel.is_cancelled();
        info!(
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes = summary.bytes,
            elapsed_secs = format!("{:.2}", summary.elapsed.as_secs_f64()),
            cancelled = summary.cancelled,
            "Transfer run finished"
        );
        Ok(summary)
    }

    /// Expand the plan and feed the queue in plan order.
    async fn dispatch(
        &self,
        plan: &TransferPlan,
        shared: &RunShared,
        permits: &Semaphore,
        tx: mpsc::Sender<Job>,
    ) {
        let cancel = shared.ctx.cancel();
        let listing_ledger = RetryLedger::new();
        let mut units = expand(
            plan,
            &self.service,
            &shared.ctx.chain,
            &listing_ledger,
            Some(permits),
        );

        let grouping = plan.grouping();
        let batch_cap = plan.concurrency.min(MAX_BATCH);
        let mut batch: Vec<Indexed> = Vec::new();
        let mut index = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = units.next() => next,
            };
            let unit = match next {
                None => break,
                Some(Ok(unit)) => unit,
                Some(Err(err)) => {
                    if shared.expansion_failed(err) {
                        break;
                    }
                    continue;
                }
            };

            let item = Indexed { index, unit };
            index += 1;

            if !grouping {
                if !send(&tx, cancel, Job::Single(item)).await {
                    break;
                }
                continue;
            }

            let fits = batch
                .first()
                .is_none_or(|first| batchable(&first.unit, &item.unit));
            if !fits || batch.len() >= batch_cap {
                let full = std::mem::take(&mut batch);
                if !send(&tx, cancel, Job::Batch(full)).await {
                    break;
                }
            }
            batch.push(item);
        }

        if !batch.is_empty() && !cancel.is_cancelled() {
            send(&tx, cancel, Job::Batch(batch)).await;
        }
        debug!(units = index, "Dispatch finished");
    }
}

/// Queue a job unless the run is cancelled first.
async fn send(tx: &mpsc::Sender<Job>, cancel: &CancellationToken, job: Job) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(job) => sent.is_ok(),
    }
}

/// State shared by the dispatcher and every worker of one run.
struct RunShared {
    ctx: EngineContext,
    engine: Arc<dyn TransferEngine>,
    resume: bool,
    summary: Mutex<RunSummary>,
    fatal: Mutex<Option<TransferError>>,
}

impl RunShared {
    async fn work(&self, rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };

            // Queued work is dropped once the run is cancelled.
            if self.ctx.cancel().is_cancelled() {
                continue;
            }
            match job {
                Job::Single(item) => self.run_single(item).await,
                Job::Batch(items) => self.run_batch(items).await,
            }
        }
    }

    /// Consult the store. Returns `None` when the unit is already finished.
    async fn prepare(&self, item: Indexed) -> Option<Pending> {
        let Indexed { index, unit } = item;
        let fingerprint = fingerprint(&unit);
        let name = unit.name();

        let status = match self
            .ctx
            .store
            .status(unit.category(), &fingerprint, unit.total_bytes())
            .await
        {
            Ok(status) => status,
            Err(e) => {
                self.finish(index, &name, &fingerprint, &unit, Err(e.into()))
                    .await;
                return None;
            }
        };

        let resume_from = match status {
            UnitStatus::Done => {
                debug!(unit = %name, "Already done, skipping");
                self.finish(
                    index,
                    &name,
                    &fingerprint,
                    &unit,
                    Ok(UnitOutcome::skipped(SkipReason::AlreadyDone)),
                )
                .await;
                return None;
            }
            UnitStatus::Partial(state) if self.resume => Some(state),
            UnitStatus::Partial(_) | UnitStatus::Unknown => None,
        };

        Some(Pending {
            index,
            unit,
            fingerprint,
            name,
            resume_from,
        })
    }

    async fn run_single(&self, item: Indexed) {
        let Some(pending) = self.prepare(item).await else {
            return;
        };

        let permit = tokio::select! {
            biased;
            _ = self.ctx.cancel().cancelled() => return,
            permit = Arc::clone(&self.ctx.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        self.started(&pending).await;
        let ledger = RetryLedger::new();
        let result = self.transfer(&pending, &ledger).await;
        drop(permit);

        self.finish_pending(&pending, result, &ledger).await;
    }

    /// Batches hold one permit per member for the single remote call, so
    /// a batch of `k` counts as `k` units in flight.
    async fn run_batch(&self, items: Vec<Indexed>) {
        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            if let Some(p) = self.prepare(item).await {
                pending.push(p);
            }
        }
        if pending.is_empty() {
            return;
        }

        let permit = tokio::select! {
            biased;
            _ = self.ctx.cancel().cancelled() => return,
            permit = Arc::clone(&self.ctx.permits).acquire_many_owned(pending.len() as u32) => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        for p in &pending {
            self.started(p).await;
        }

        let ledger = RetryLedger::new();
        let units: Vec<WorkUnit> = pending.iter().map(|p| p.unit.clone()).collect();
        let batched = AssertUnwindSafe(self.engine.transfer_batch(&self.ctx, &units, &ledger))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let err = TransferError::internal(format!(
                    "panic in batch transfer: {}",
                    panic_message(payload.as_ref())
                ));
                Some(units.iter().map(|_| Err(err.clone())).collect())
            });

        match batched {
            Some(results) => {
                let mut retried = 0;
                for (p, result) in pending.iter().zip(results) {
                    // Members that failed on their own are retried one by
                    // one; fatal and cancelled outcomes are final.
                    let (result, member_ledger) = match result {
                        Err(e) if !e.is_fatal() && !e.is_cancelled() && !self.ctx.cancel().is_cancelled() => {
                            retried += 1;
                            debug!(unit = %p.name, error = %e, "Retrying batch member on its own");
                            let own = RetryLedger::new();
                            let result = self.transfer(p, &own).await;
                            (result, Some(own))
                        }
                        other => (other, None),
                    };
                    self.finish_pending(p, result, member_ledger.as_ref().unwrap_or(&ledger))
                        .await;
                }
                if retried > 0 {
                    info!(size = pending.len(), retried, "Split failed batch members");
                }
            }
            None => {
                for p in &pending {
                    let own = RetryLedger::new();
                    let result = self.transfer(p, &own).await;
                    self.finish_pending(p, result, &own).await;
                }
            }
        }
        drop(permit);
    }

    async fn started(&self, p: &Pending) {
        self.ctx
            .events
            .lifecycle(SchedulerEvent::Started {
                unit_index: p.index,
                unit_name: p.name.clone(),
                total_bytes: p.unit.total_bytes(),
            })
            .await;
    }

    /// Run the engine on one unit. Panics outside the remote calls are
    /// contained here the same way the chain contains them inside.
    async fn transfer(&self, p: &Pending, ledger: &RetryLedger) -> Result<UnitOutcome, TransferError> {
        let run = UnitRun {
            index: p.index,
            name: &p.name,
            fingerprint: &p.fingerprint,
            ledger,
            resume_from: p.resume_from,
        };
        let span = info_span!("unit", index = p.index, unit = %p.name);
        AssertUnwindSafe(self.engine.transfer(&self.ctx, &p.unit, &run))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|payload| {
                Err(TransferError::internal(format!(
                    "panic while transferring {}: {}",
                    p.name,
                    panic_message(payload.as_ref())
                )))
            })
    }

    async fn finish_pending(
        &self,
        p: &Pending,
        result: Result<UnitOutcome, TransferError>,
        ledger: &RetryLedger,
    ) {
        let attempts = ledger.attempts();
        if attempts > 1 {
            debug!(unit = %p.name, attempts, "Unit needed several attempts");
        }
        self.finish(p.index, &p.name, &p.fingerprint, &p.unit, result)
            .await;
    }

    /// Persist the terminal state, tally it and tell the caller.
    async fn finish(
        &self,
        index: usize,
        name: &str,
        fingerprint: &str,
        unit: &WorkUnit,
        result: Result<UnitOutcome, TransferError>,
    ) {
        let category = unit.category();
        let size = unit.total_bytes();

        let outcome = match result {
            Ok(outcome) if outcome.completes() => {
                match self.ctx.store.mark_done(category, fingerprint, size).await {
                    Ok(()) => outcome,
                    Err(e) => {
                        let err = TransferError::from(e);
                        warn!(unit = %name, error = %err, "Transferred, but could not record completion");
                        UnitOutcome::failed(&err)
                    }
                }
            }
            Ok(outcome) => outcome,
            Err(err) => {
                self.record_failure(category, name, fingerprint, size, &err)
                    .await;
                UnitOutcome::failed(&err)
            }
        };

        {
            let mut summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
            summary.record(index, name, &outcome);
        }
        self.ctx
            .events
            .lifecycle(SchedulerEvent::Finished {
                unit_index: index,
                unit_name: name.to_string(),
                fingerprint: fingerprint.to_string(),
                outcome,
            })
            .await;
        self.ctx.events.finished(fingerprint).await;
    }

    async fn record_failure(
        &self,
        category: Category,
        name: &str,
        fingerprint: &str,
        size: u64,
        err: &TransferError,
    ) {
        if err.is_fatal() {
            self.set_fatal(err.clone());
            return;
        }
        if err.is_cancelled() {
            // The partial record stays as committed.
            debug!(unit = %name, "Unit cancelled");
            return;
        }

        warn!(unit = %name, kind = %err.kind(), error = %err, "Unit failed");
        if let Err(e) = self
            .ctx
            .store
            .mark_failed(category, fingerprint, err, size)
            .await
        {
            warn!(unit = %name, error = %e, "Could not record failure");
        }
    }

    /// Returns true if dispatch should stop.
    fn expansion_failed(&self, err: TransferError) -> bool {
        if err.is_fatal() {
            self.set_fatal(err);
            return true;
        }
        if err.is_cancelled() {
            return true;
        }

        warn!(kind = %err.kind(), error = %err, "Could not expand part of the plan");
        let outcome = UnitOutcome::failed(&err);
        let mut summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        let index = summary.total();
        summary.record(index, "plan expansion", &outcome);
        false
    }

    /// The first fatal error wins and cancels the run.
    fn set_fatal(&self, err: TransferError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            error!(error = %err, "Session is no longer valid, aborting run");
            *fatal = Some(err);
        }
        self.ctx.cancel().cancel();
    }

    fn take_fatal(&self) -> Option<TransferError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn summary(&self) -> RunSummary {
        self.summary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{DownloadOptions, ForwardOptions, PlanOptions, UnitSelector};
    use crate::error::ErrorKind;
    use crate::remote::{Fault, MessageRef, SimulatedService, endpoint};
    use crate::storage::{SqliteStorage, Storage};

    async fn scheduler(sim: Arc<SimulatedService>) -> Scheduler {
        let storage = SqliteStorage::open_in_memory().await.unwrap();
        let ns = storage.open("default").await.unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_flood_retries: 2,
        };
        Scheduler::new(sim, Throttle::new(), ns, policy)
    }

    fn seeded(n: usize) -> Arc<SimulatedService> {
        let sim = Arc::new(SimulatedService::new());
        for i in 0..n {
            sim.add_media_message(1, &format!("f{i}.bin"), "application/octet-stream", vec![i as u8; 64], None);
        }
        sim
    }

    fn download_plan(dir: &std::path::Path, n: i32) -> TransferPlan {
        let mut opts = DownloadOptions::new(dir);
        opts.chunk_size = 4096;
        TransferPlan::new(
            UnitSelector::Messages((1..=n).map(|i| MessageRef::new(1, i)).collect()),
            PlanOptions::Download(opts),
        )
    }

    #[test]
    fn only_same_route_forwards_batch() {
        let fwd = |chat, target| {
            WorkUnit::Forward(crate::core::models::ForwardUnit {
                source: MessageRef::new(chat, 1),
                target,
                grouped_id: None,
                media_name: None,
            })
        };
        assert!(batchable(&fwd(1, 2), &fwd(1, 2)));
        assert!(!batchable(&fwd(1, 2), &fwd(1, 3)));
        assert!(!batchable(&fwd(1, 2), &fwd(4, 2)));
    }

    #[tokio::test]
    async fn events_bracket_every_unit() {
        let dir = tempfile::tempdir().unwrap();
        let sim = seeded(3);
        let (tx, mut rx) = mpsc::channel(64);
        let scheduler = scheduler(sim).await.with_events(tx);

        let summary = scheduler
            .run(&download_plan(dir.path(), 3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.done, 3);
        drop(scheduler);

        let mut started = 0;
        let mut finished = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::Started { .. } => started += 1,
                SchedulerEvent::Finished { outcome, .. } => {
                    assert_eq!(outcome, UnitOutcome::Done { bytes: 64 });
                    finished += 1;
                }
                SchedulerEvent::Progress(p) => assert!(p.bytes_transferred <= p.total_bytes),
            }
        }
        assert_eq!((started, finished), (3, 3));
    }

    #[tokio::test]
    async fn permanent_failure_is_recorded_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let sim = seeded(2);
        sim.inject(endpoint::GET_FILE, Fault::Reject(crate::remote::RejectCode::NotFound));
        let scheduler = scheduler(sim).await;

        let mut plan = download_plan(dir.path(), 2);
        plan.concurrency = 1;
        let summary = scheduler.run(&plan, &CancellationToken::new()).await.unwrap();

        assert_eq!((summary.done, summary.failed), (1, 1));
        assert_eq!(summary.failures[0].kind, ErrorKind::PermanentRequest);
        let counts = scheduler.store().counts(Category::Download).await.unwrap();
        assert_eq!((counts.done, counts.failed), (1, 1));
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected_up_front() {
        let sim = seeded(1);
        let scheduler = scheduler(sim.clone()).await;
        let mut plan = download_plan(std::path::Path::new("/tmp"), 1);
        plan.resume = true;
        plan.restart = true;

        let err = scheduler
            .run(&plan, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentRequest);
        assert_eq!(sim.total_calls(), 0);
    }

    #[tokio::test]
    async fn restart_clears_history() {
        let dir = tempfile::tempdir().unwrap();
        let sim = seeded(2);
        let scheduler = scheduler(sim.clone()).await;
        let plan = download_plan(dir.path(), 2);
        scheduler.run(&plan, &CancellationToken::new()).await.unwrap();

        let mut again = plan.clone();
        again.restart = true;
        let summary = scheduler.run(&again, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.done, 2);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn dry_run_forward_reports_skips() {
        let sim = seeded(3);
        let scheduler = scheduler(sim.clone()).await;
        let mut opts = ForwardOptions::new(9);
        opts.dry_run = true;
        let mut plan = TransferPlan::new(
            UnitSelector::Messages((1..=3).map(|i| MessageRef::new(1, i)).collect()),
            PlanOptions::Forward(opts),
        );
        plan.group = true;

        let summary = scheduler.run(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.skipped, 3);
        assert_eq!(sim.calls_to(endpoint::FORWARD), 0);
        // Dry runs leave no history behind.
        let counts = scheduler.store().counts(Category::Forward).await.unwrap();
        assert_eq!(counts.done, 0);
    }
}
