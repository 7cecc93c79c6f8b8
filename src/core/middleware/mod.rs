//! The layers every remote call passes through.
//!
//! ```text
//! recovery     panics -> Internal, logs the classified failure
//!   retry      transient failures: exponential backoff with jitter
//!     rate     cooldown gate, flood directives, cancellation
//!       call
//! ```
//!
//! Raw [`RpcError`]s are classified into [`TransferError`]s inside the chain;
//! nothing above it sees a transport error.

pub mod rate_limit;
pub mod recovery;
pub mod retry;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::throttle::Throttle;
use crate::error::TransferError;
use crate::remote::RpcError;

pub use retry::{LedgerSnapshot, RetryLedger, RetryPolicy};

/// What every layer needs to know about the call in progress.
pub struct CallContext<'a> {
    pub endpoint: &'static str,
    pub ledger: &'a RetryLedger,
    pub throttle: &'a Throttle,
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
}

/// The assembled middleware stack, shared by every worker of a run.
#[derive(Clone)]
pub struct Chain {
    throttle: Throttle,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Chain {
    pub fn new(throttle: Throttle, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            throttle,
            policy,
            cancel,
        }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `call` through recovery, retry and rate-limit layers.
    ///
    /// `call` is invoked once per physical attempt and must be safe to repeat.
    pub async fn invoke<T, F, Fut>(
        &self,
        endpoint: &'static str,
        ledger: &RetryLedger,
        call: F,
    ) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let ctx = CallContext {
            endpoint,
            ledger,
            throttle: &self.throttle,
            policy: &self.policy,
            cancel: &self.cancel,
        };

        recovery::guard(
            &ctx,
            retry::with_backoff(&ctx, || rate_limit::gate(&ctx, &call)),
        )
        .await
    }
}
