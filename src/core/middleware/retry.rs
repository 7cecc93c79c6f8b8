use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::warn;

use super::CallContext;
use crate::error::{ErrorKind, TransferError};

/// Backoff parameters for transient failures and the flood-retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Physical attempts allowed per call before a transient failure is terminal.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Flood directives obeyed per call before giving up.
    pub max_flood_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_flood_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, clamped to `max_delay`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Ceiling plus uniform jitter in `[0, base]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base_ms);
        self.backoff_ceiling(attempt) + Duration::from_millis(jitter)
    }
}

/// Retry bookkeeping for one work unit. Created when the unit starts and
/// dropped when it reaches a terminal state.
#[derive(Debug, Default)]
pub struct RetryLedger {
    state: Mutex<LedgerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Physical calls issued, across all of the unit's requests.
    pub attempts: u32,
    /// Transient failures since the last success.
    pub consecutive_transient: u32,
    pub flood_waits: u32,
    pub last_error: Option<ErrorKind>,
    pub next_eligible: Option<Instant>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub(crate) fn record_attempt(&self) {
        self.lock().attempts += 1;
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_transient = 0;
        state.next_eligible = None;
    }

    /// Returns the number of consecutive transient failures.
    pub(crate) fn record_transient(&self, kind: ErrorKind) -> u32 {
        let mut state = self.lock();
        state.consecutive_transient += 1;
        state.last_error = Some(kind);
        state.next_eligible = None;
        state.consecutive_transient
    }

    pub(crate) fn schedule(&self, retry_at: Instant) {
        self.lock().next_eligible = Some(retry_at);
    }

    pub(crate) fn record_flood(&self, retry_at: Instant) {
        let mut state = self.lock();
        state.flood_waits += 1;
        state.last_error = Some(ErrorKind::Flood);
        state.next_eligible = Some(retry_at);
    }

    pub(crate) fn record_error(&self, kind: ErrorKind) {
        let mut state = self.lock();
        state.last_error = Some(kind);
        state.next_eligible = None;
    }
}

/// Retry layer: repeats `attempt` with exponential backoff while it fails
/// with a transient transport error.
pub async fn with_backoff<T, F, Fut>(
    ctx: &CallContext<'_>,
    mut attempt: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    loop {
        let err = match attempt().await {
            Ok(value) => {
                ctx.ledger.record_success();
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            ctx.ledger.record_error(err.kind());
            return Err(err);
        }

        let failures = ctx.ledger.record_transient(err.kind());
        if failures >= ctx.policy.max_attempts {
            warn!(
                endpoint = ctx.endpoint,
                attempts = failures,
                error = %err,
                "Giving up after repeated transient failures"
            );
            return Err(err);
        }

        let delay = ctx.policy.backoff(failures - 1);
        ctx.ledger.schedule(Instant::now() + delay);
        warn!(
            endpoint = ctx.endpoint,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::cancelled()),
            _ = sleep(delay) => {}
        }
    }
}
