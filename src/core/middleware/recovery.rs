use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error};

use super::CallContext;
use crate::error::TransferError;

/// Recovery layer, outermost.
///
/// A panic anywhere below is caught and turned into an `Internal` failure
/// instead of taking the worker down with it.
pub async fn guard<T, Fut>(ctx: &CallContext<'_>, inner: Fut) -> Result<T, TransferError>
where
    Fut: Future<Output = Result<T, TransferError>>,
{
    match AssertUnwindSafe(inner).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let ledger = ctx.ledger.snapshot();
            debug!(
                endpoint = ctx.endpoint,
                kind = %err.kind(),
                attempts = ledger.attempts,
                error = %err,
                "Call failed"
            );
            Err(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                endpoint = ctx.endpoint,
                panic = %message,
                "Recovered from panic inside remote call"
            );
            let err = TransferError::internal(format!("panic in {}: {}", ctx.endpoint, message));
            ctx.ledger.record_error(err.kind());
            Err(err)
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_panic_text() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
