//! Connection lifecycle for one account.
//!
//! [`SessionManager::run`] connects, restores the stored login, optionally
//! opens a takeout session, hands a [`ClientHandle`] to the caller and tears
//! everything down afterwards, including when the caller panics or its
//! future is dropped.

pub mod clock;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::middleware::recovery::panic_message;
use crate::core::{Chain, RetryLedger, RetryPolicy, Throttle};
use crate::error::{ErrorKind, TransferError};
use crate::remote::{
    AppType, ConnectOptions, Connector, Credentials, RemoteService, SessionInfo, endpoint,
};
use crate::storage::{Namespace, get_json, keys, set_json};

pub use clock::{ClockSource, FixedOffset, SntpClock, SystemClock};

/// Fixed at construction; sourced from configuration.
#[derive(Clone)]
pub struct SessionOptions {
    pub proxy: Option<String>,
    /// Bound on establishing the connection.
    pub reconnect_timeout: Duration,
    pub clock: Arc<dyn ClockSource>,
    /// Ask the remote for a bulk-export session with relaxed rate limits.
    pub takeout: bool,
    pub app: AppType,
    /// Policy for the session's own calls (restore, takeout).
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            reconnect_timeout: Duration::from_secs(300),
            clock: Arc::new(SystemClock),
            takeout: false,
            app: AppType::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// An authenticated connection, valid for the duration of [`SessionManager::run`].
#[derive(Clone)]
pub struct ClientHandle {
    pub service: Arc<dyn RemoteService>,
    pub info: SessionInfo,
    /// Open takeout session. The connection applies it to every call made
    /// through `service`; it is informational for callers.
    pub takeout_id: Option<i64>,
    /// The session's shared cooldown state.
    pub throttle: Throttle,
    pub namespace: Arc<dyn Namespace>,
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    namespace: Arc<dyn Namespace>,
    options: SessionOptions,
    throttle: Throttle,
}

/// Closes the connection (and abandons the takeout) if `run` is dropped
/// before it could clean up itself.
struct TeardownGuard {
    service: Option<Arc<dyn RemoteService>>,
    takeout_id: Option<i64>,
}

impl TeardownGuard {
    fn new(service: Arc<dyn RemoteService>) -> Self {
        Self {
            service: Some(service),
            takeout_id: None,
        }
    }

    fn disarm(&mut self) {
        self.service = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        let takeout_id = self.takeout_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Session dropped mid-run, closing connection");
                handle.spawn(async move {
                    if let Some(id) = takeout_id {
                        if let Err(e) = service.finish_takeout(id, false).await {
                            debug!(error = %e, "Could not finish takeout session");
                        }
                    }
                    service.close().await;
                });
            }
            Err(_) => warn!("Session dropped outside a runtime, connection left open"),
        }
    }
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        namespace: Arc<dyn Namespace>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            namespace,
            options,
            throttle: Throttle::new(),
        }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn namespace(&self) -> &Arc<dyn Namespace> {
        &self.namespace
    }

    fn session_key(&self) -> String {
        keys::session(self.options.app)
    }

    /// Account recorded by the last successful login, if any.
    pub async fn stored_user(&self) -> Result<Option<SessionInfo>, TransferError> {
        Ok(get_json(self.namespace.as_ref(), keys::USER_INFO).await?)
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteService>, TransferError> {
        let clock_offset_ms = match self.options.clock.offset_ms().await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(
                    source = %self.options.clock.describe(),
                    error = %e,
                    "Clock offset unavailable, using local time"
                );
                0
            }
        };

        let options = ConnectOptions {
            proxy: self.options.proxy.clone(),
            clock_offset_ms,
            reconnect_timeout: self.options.reconnect_timeout,
            app: self.options.app,
        };
        debug!(
            proxy = options.proxy.as_deref().unwrap_or("none"),
            clock_offset_ms,
            "Connecting"
        );

        match timeout(self.options.reconnect_timeout, self.connector.connect(&options)).await {
            Ok(result) => result.map_err(TransferError::from),
            Err(_) => Err(TransferError::new(
                ErrorKind::TransientTransport,
                format!(
                    "could not connect within {}s",
                    self.options.reconnect_timeout.as_secs()
                ),
            )),
        }
    }

    fn chain(&self) -> Chain {
        Chain::new(
            self.throttle.clone(),
            self.options.retry.clone(),
            CancellationToken::new(),
        )
    }

    /// Authorize with `credentials` and store the resulting session.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionInfo, TransferError> {
        let service = self.connect().await?;
        let mut guard = TeardownGuard::new(Arc::clone(&service));

        let result = async {
            let session = service.sign_in(credentials).await?;
            let info = service.restore_session(&session).await?;
            self.namespace.set(&self.session_key(), &session).await?;
            set_json(self.namespace.as_ref(), keys::USER_INFO, &info).await?;
            Ok::<_, TransferError>(info)
        }
        .await;

        guard.disarm();
        service.close().await;

        let info = result?;
        info!(user_id = info.user_id, namespace = %self.namespace.name(), "Logged in");
        Ok(info)
    }

    /// Revoke the stored session remotely and forget it locally.
    pub async fn logout(&self) -> Result<(), TransferError> {
        let key = self.session_key();
        let Some(session) = self.namespace.get_opt(&key).await? else {
            return Err(TransferError::fatal_session("not logged in"));
        };

        let service = self.connect().await?;
        let mut guard = TeardownGuard::new(Arc::clone(&service));
        let remote = async {
            service.restore_session(&session).await?;
            service.log_out().await
        }
        .await;
        guard.disarm();
        service.close().await;

        // An already-invalid session is as good as logged out.
        if let Err(e) = remote {
            warn!(error = %e, "Remote logout failed, removing local session anyway");
        }
        for k in [key.as_str(), keys::USER_INFO] {
            match self.namespace.delete(k).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(namespace = %self.namespace.name(), "Logged out");
        Ok(())
    }

    /// Run `f` with an authenticated client.
    ///
    /// A missing or rejected session is a [`FatalSession`](ErrorKind::FatalSession)
    /// error. The connection is closed and any takeout session finished on
    /// every exit path.
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T, TransferError>
    where
        F: FnOnce(ClientHandle) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let key = self.session_key();
        let session = self.namespace.get_opt(&key).await?.ok_or_else(|| {
            TransferError::fatal_session(format!(
                "namespace '{}' has no login session; log in first",
                self.namespace.name()
            ))
        })?;

        let span = info_span!("session", namespace = %self.namespace.name(), takeout = self.options.takeout);
        async {
            let service = self.connect().await?;
            let mut guard = TeardownGuard::new(Arc::clone(&service));

            let outcome = self
                .authenticated(&service, &session, &key, &mut guard, f)
                .await;

            guard.disarm();
            service.close().await;
            debug!(ok = outcome.is_ok(), "Connection closed");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn authenticated<T, F, Fut>(
        &self,
        service: &Arc<dyn RemoteService>,
        session: &[u8],
        key: &str,
        guard: &mut TeardownGuard,
        f: F,
    ) -> Result<T, TransferError>
    where
        F: FnOnce(ClientHandle) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let chain = self.chain();
        let ledger = RetryLedger::new();

        let info = chain
            .invoke(endpoint::SIGN_IN, &ledger, || service.restore_session(session))
            .await?;
        info!(user_id = info.user_id, "Session restored");

        match service.export_session().await {
            Ok(refreshed) => self.namespace.set(key, &refreshed).await?,
            Err(e) => warn!(error = %e, "Could not refresh stored session"),
        }

        let takeout_id = if self.options.takeout {
            let id = chain
                .invoke(endpoint::TAKEOUT_INIT, &ledger, || service.init_takeout())
                .await?;
            info!(takeout_id = id, "Takeout session opened");
            guard.takeout_id = Some(id);
            Some(id)
        } else {
            None
        };

        let handle = ClientHandle {
            service: Arc::clone(service),
            info,
            takeout_id,
            throttle: self.throttle.clone(),
            namespace: Arc::clone(&self.namespace),
        };

        let result = AssertUnwindSafe(f(handle))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(TransferError::internal(format!(
                    "panic inside session: {}",
                    panic_message(payload.as_ref())
                )))
            });

        if let Some(id) = takeout_id {
            let success = result.is_ok();
            match chain
                .invoke(endpoint::TAKEOUT_FINISH, &ledger, || {
                    service.finish_takeout(id, success)
                })
                .await
            {
                Ok(()) => info!(takeout_id = id, success, "Takeout session finished"),
                Err(e) => warn!(takeout_id = id, error = %e, "Could not finish takeout session"),
            }
            guard.takeout_id = None;
        }

        result
    }
}
