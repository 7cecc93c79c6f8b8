use std::future::Future;

use tracing::{debug, warn};

use super::CallContext;
use crate::error::{ErrorKind, TransferError};
use crate::remote::RpcError;

/// Rate-limit layer, closest to the wire.
///
/// Holds every physical attempt until no cooldown applies to the endpoint,
/// races the call against cancellation, and turns flood directives into
/// shared cooldowns that are waited out here without touching the retry
/// layer's transient budget.
pub async fn gate<T, F, Fut>(ctx: &CallContext<'_>, call: &F) -> Result<T, TransferError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut floods = 0u32;

    loop {
        ctx.throttle.wait_ready(ctx.endpoint, ctx.cancel).await?;
        ctx.ledger.record_attempt();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(RpcError::Cancelled),
            result = call() => result,
        };

        match result {
            Ok(value) => {
                ctx.throttle.record_success().await;
                return Ok(value);
            }
            Err(RpcError::Flood { wait, scope }) => {
                floods += 1;
                let deadline = ctx.throttle.extend(scope.as_deref(), wait).await;
                ctx.ledger.record_flood(deadline);

                if floods > ctx.policy.max_flood_retries {
                    warn!(
                        endpoint = ctx.endpoint,
                        floods,
                        wait_secs = wait.as_secs(),
                        "Flood retry budget exhausted"
                    );
                    return Err(TransferError::new(
                        ErrorKind::Flood,
                        format!(
                            "{} still throttled after {} flood waits (last {}s)",
                            ctx.endpoint,
                            floods,
                            wait.as_secs()
                        ),
                    ));
                }

                warn!(
                    endpoint = ctx.endpoint,
                    scope = scope.as_deref().unwrap_or("*"),
                    wait_secs = wait.as_secs(),
                    "Flood wait requested by remote"
                );
            }
            Err(err) => {
                if err.is_transient() {
                    let failures = ctx.throttle.record_failure().await;
                    debug!(endpoint = ctx.endpoint, failures, "Transport failure");
                }
                return Err(err.into());
            }
        }
    }
}
