//! Shared rate-limit posture toward the remote service.
//!
//! One [`Throttle`] exists per client session and is cloned into every worker.
//! Cooldown deadlines only ever move later: a shorter flood directive never
//! shortens a longer one that is already in force.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;

#[derive(Debug, Default)]
struct ThrottleState {
    global_until: Option<Instant>,
    scoped_until: HashMap<String, Instant>,
    consecutive_failures: u32,
    flood_directives: u64,
}

/// Point-in-time view, for status output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThrottleSnapshot {
    pub global_wait: Option<Duration>,
    pub scoped_waits: Vec<(String, Duration)>,
    pub consecutive_failures: u32,
    pub flood_directives: u64,
}

#[derive(Clone, Default)]
pub struct Throttle {
    inner: Arc<RwLock<ThrottleState>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a flood directive of `wait` to `scope` (or to every endpoint
    /// when `None`). Returns the deadline now in force for that scope.
    pub async fn extend(&self, scope: Option<&str>, wait: Duration) -> Instant {
        let candidate = Instant::now() + wait;
        let mut state = self.inner.write().await;
        state.flood_directives += 1;

        let slot = match scope {
            Some(endpoint) => state
                .scoped_until
                .entry(endpoint.to_string())
                .or_insert(candidate),
            None => state.global_until.get_or_insert(candidate),
        };
        if candidate > *slot {
            *slot = candidate;
        }
        let effective = *slot;

        debug!(
            scope = scope.unwrap_or("*"),
            wait_ms = wait.as_millis() as u64,
            "Cooldown extended"
        );
        effective
    }

    /// Deadline a call to `endpoint` must wait for, if any is still pending.
    pub async fn deadline(&self, endpoint: &str) -> Option<Instant> {
        let now = Instant::now();
        let state = self.inner.read().await;
        let scoped = state.scoped_until.get(endpoint).copied();
        [state.global_until, scoped]
            .into_iter()
            .flatten()
            .filter(|d| *d > now)
            .max()
    }

    pub async fn global_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        self.inner.read().await.global_until.filter(|d| *d > now)
    }

    /// Suspend the caller until no cooldown applies to `endpoint`.
    ///
    /// Re-checks after every wake-up, since another worker may have pushed
    /// the deadline further out in the meantime.
    pub async fn wait_ready(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        while let Some(deadline) = self.deadline(endpoint).await {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::cancelled()),
                _ = sleep_until(deadline) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(TransferError::cancelled());
        }
        Ok(())
    }

    /// A call went through without being throttled.
    pub async fn record_success(&self) {
        let now = Instant::now();
        let mut state = self.inner.write().await;
        state.consecutive_failures = 0;
        if state.global_until.is_some_and(|d| d <= now) {
            state.global_until = None;
        }
        state.scoped_until.retain(|_, d| *d > now);
    }

    /// Returns the new consecutive-failure count.
    pub async fn record_failure(&self) -> u32 {
        let mut state = self.inner.write().await;
        state.consecutive_failures += 1;
        state.consecutive_failures
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }

    pub async fn snapshot(&self) -> ThrottleSnapshot {
        let now = Instant::now();
        let state = self.inner.read().await;
        let mut scoped_waits: Vec<(String, Duration)> = state
            .scoped_until
            .iter()
            .filter(|(_, d)| **d > now)
            .map(|(k, d)| (k.clone(), *d - now))
            .collect();
        scoped_waits.sort();

        ThrottleSnapshot {
            global_wait: state.global_until.filter(|d| *d > now).map(|d| d - now),
            scoped_waits,
            consecutive_failures: state.consecutive_failures,
            flood_directives: state.flood_directives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shorter_directive_never_shortens_cooldown() {
        let throttle = Throttle::new();
        let start = Instant::now();

        throttle.extend(None, Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let effective = throttle.extend(None, Duration::from_secs(2)).await;

        assert_eq!(effective, start + Duration::from_secs(10));
        assert_eq!(
            throttle.global_deadline().await,
            Some(start + Duration::from_secs(10))
        );

        let later = throttle.extend(None, Duration::from_secs(20)).await;
        assert_eq!(later, start + Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn scoped_cooldown_only_blocks_its_endpoint() {
        let throttle = Throttle::new();
        throttle
            .extend(Some("upload.getFile"), Duration::from_secs(5))
            .await;

        assert!(throttle.deadline("upload.getFile").await.is_some());
        assert!(throttle.deadline("messages.getHistory").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_sleeps_until_deadline() {
        let throttle = Throttle::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        throttle.extend(None, Duration::from_secs(3)).await;

        throttle.wait_ready("any", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_is_cancellable() {
        let throttle = Throttle::new();
        let cancel = CancellationToken::new();
        throttle.extend(None, Duration::from_secs(60)).await;

        let waiter = {
            let throttle = throttle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { throttle.wait_ready("any", &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let throttle = Throttle::new();
        assert_eq!(throttle.record_failure().await, 1);
        assert_eq!(throttle.record_failure().await, 2);
        throttle.record_success().await;
        assert_eq!(throttle.consecutive_failures().await, 0);
    }
}
