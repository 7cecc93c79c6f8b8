//! Per-category transfer engines.
//!
//! An engine moves the bytes (or issues the forward) for one unit. It owns
//! nothing across units: the scheduler hands it the shared [`EngineContext`]
//! and a per-unit [`UnitRun`], and records the outcome it returns.

pub mod download;
pub mod forward;
pub mod upload;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::middleware::{Chain, RetryLedger};
use super::models::{Category, UnitOutcome, WorkUnit};
use super::plan::PlanOptions;
use super::progress::EventSink;
use super::resume::{PartialState, ResumeStore};
use crate::error::TransferError;
use crate::logging::LogThrottle;
use crate::remote::RemoteService;

pub use download::DownloadEngine;
pub use forward::ForwardEngine;
pub use upload::UploadEngine;

/// Upper bound on chunk requests one unit keeps in flight.
pub const MAX_CHUNK_WINDOW: usize = 4;

/// Shared by every worker of a run.
pub struct EngineContext {
    pub service: Arc<dyn RemoteService>,
    pub chain: Chain,
    pub store: ResumeStore,
    /// The run's concurrency budget. Workers hold one permit per unit.
    pub permits: Arc<Semaphore>,
    pub events: EventSink,
    pub chunk_log: LogThrottle,
}

impl EngineContext {
    pub fn cancel(&self) -> &CancellationToken {
        self.chain.cancel_token()
    }

    /// Grab up to `want` idle slots for chunk sub-transfers without waiting.
    ///
    /// A unit always makes progress on the permit its worker already holds;
    /// extra slots only widen its window when the pool has spare capacity.
    pub fn extra_permits(&self, want: usize) -> Vec<OwnedSemaphorePermit> {
        let mut extra = Vec::new();
        while extra.len() < want.min(MAX_CHUNK_WINDOW - 1) {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => extra.push(permit),
                Err(_) => break,
            }
        }
        extra
    }
}

/// What an engine knows about the unit it is running.
pub struct UnitRun<'a> {
    pub index: usize,
    pub name: &'a str,
    pub fingerprint: &'a str,
    pub ledger: &'a RetryLedger,
    /// Committed state from an earlier run, when resuming.
    pub resume_from: Option<PartialState>,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    fn category(&self) -> Category;

    async fn transfer(
        &self,
        ctx: &EngineContext,
        unit: &WorkUnit,
        run: &UnitRun<'_>,
    ) -> Result<UnitOutcome, TransferError>;

    /// Move several units in one remote call, if the engine supports it.
    ///
    /// `None` means batching is unsupported and the caller should fall back
    /// to [`transfer`](Self::transfer). Otherwise the results follow the
    /// order of `units`.
    async fn transfer_batch(
        &self,
        _ctx: &EngineContext,
        _units: &[WorkUnit],
        _ledger: &RetryLedger,
    ) -> Option<Vec<Result<UnitOutcome, TransferError>>> {
        None
    }
}

pub fn engine_for(options: &PlanOptions) -> Arc<dyn TransferEngine> {
    match options {
        PlanOptions::Download(opts) => Arc::new(DownloadEngine::new(opts.clone())),
        PlanOptions::Upload(opts) => Arc::new(UploadEngine::new(opts.clone())),
        PlanOptions::Forward(opts) => Arc::new(ForwardEngine::new(opts.clone())),
    }
}

pub(crate) fn wrong_unit(engine: Category, unit: &WorkUnit) -> TransferError {
    TransferError::internal(format!(
        "{} engine cannot run a {} unit",
        engine,
        unit.category()
    ))
}
