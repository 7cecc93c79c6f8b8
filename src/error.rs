//! Error taxonomy shared by the storage layer, the middleware chain and the
//! scheduler.
//!
//! Raw transport outcomes ([`RpcError`](crate::remote::RpcError)) never cross the
//! middleware boundary: the chain classifies them into a [`TransferError`] whose
//! [`ErrorKind`] decides retry, cooldown, unit failure or whole-run abort.

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::{RejectCode, RpcError};

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key does not exist in the namespace.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespace names must be usable as directory names by every backend.
    #[error("invalid namespace name '{0}'")]
    InvalidNamespace(String),

    #[error("migration of namespace '{namespace}' failed: {reason}")]
    Migration { namespace: String, reason: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub(crate) fn backend(err: impl fmt::Display) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network reset, timeout. Retried with backoff.
    TransientTransport,
    /// The remote imposed a wait and the flood-retry budget ran out.
    Flood,
    /// Bad reference, permission denied, not found. Never retried.
    PermanentRequest,
    /// Disk full, unwritable output path, broken local state store.
    LocalResource,
    /// Authentication invalidated. Aborts the whole run.
    FatalSession,
    /// The shared cancellation signal fired.
    Cancelled,
    /// A fault that escaped the transport (panic, broken invariant).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientTransport => "transient_transport",
            ErrorKind::Flood => "flood",
            ErrorKind::PermanentRequest => "permanent_request",
            ErrorKind::LocalResource => "local_resource",
            ErrorKind::FatalSession => "fatal_session",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the failure happened on this machine rather than on the remote side.
    pub fn is_local(&self) -> bool {
        matches!(self, ErrorKind::LocalResource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure, as seen by the scheduler and callers.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    kind: ErrorKind,
    message: String,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transfer cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn fatal_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalSession, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentRequest, message)
    }

    /// Wrap a local I/O failure on `path`, keeping the errno-derived reason.
    pub fn local(err: &io::Error, path: &Path) -> Self {
        Self::new(
            ErrorKind::LocalResource,
            format!("{} ({}): {}", describe_io_error(err), path.display(), err),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Only transient transport failures are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::TransientTransport
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::FatalSession
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<RpcError> for TransferError {
    fn from(err: RpcError) -> Self {
        let kind = match &err {
            RpcError::Transport(_) | RpcError::Timeout(_) => ErrorKind::TransientTransport,
            RpcError::Flood { .. } => ErrorKind::Flood,
            RpcError::Rejected { code, .. } => match code {
                RejectCode::NotFound | RejectCode::PermissionDenied | RejectCode::BadRequest => {
                    ErrorKind::PermanentRequest
                }
            },
            RpcError::Unauthorized(_) => ErrorKind::FatalSession,
            RpcError::Cancelled => ErrorKind::Cancelled,
            RpcError::Internal(_) => ErrorKind::Internal,
        };
        TransferError::new(kind, err.to_string())
    }
}

impl From<StorageError> for TransferError {
    fn from(err: StorageError) -> Self {
        TransferError::new(ErrorKind::LocalResource, format!("state store: {}", err))
    }
}

/// Short human-readable reason for a local I/O error, keyed on errno.
pub fn describe_io_error(err: &io::Error) -> &'static str {
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::ENOSPC => return "disk full",
            libc::EDQUOT => return "disk quota exceeded",
            libc::EROFS => return "read-only filesystem",
            libc::EACCES | libc::EPERM => return "permission denied",
            libc::ENAMETOOLONG => return "file name too long",
            libc::EIO => return "device I/O error",
            _ => {}
        }
    }

    match err.kind() {
        io::ErrorKind::NotFound => "path not found",
        io::ErrorKind::PermissionDenied => "permission denied",
        io::ErrorKind::AlreadyExists => "path already exists",
        _ => "local I/O error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rpc_errors_are_classified() {
        let cases = [
            (RpcError::Transport("reset".into()), ErrorKind::TransientTransport),
            (RpcError::Timeout(Duration::from_secs(1)), ErrorKind::TransientTransport),
            (
                RpcError::Flood {
                    wait: Duration::from_secs(3),
                    scope: None,
                },
                ErrorKind::Flood,
            ),
            (
                RpcError::Rejected {
                    code: RejectCode::NotFound,
                    message: "MESSAGE_ID_INVALID".into(),
                },
                ErrorKind::PermanentRequest,
            ),
            (
                RpcError::Unauthorized("AUTH_KEY_UNREGISTERED".into()),
                ErrorKind::FatalSession,
            ),
            (RpcError::Cancelled, ErrorKind::Cancelled),
        ];

        for (err, kind) in cases {
            assert_eq!(TransferError::from(err).kind(), kind);
        }
    }

    #[test]
    fn disk_full_is_local_resource() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        let classified = TransferError::local(&err, Path::new("/tmp/out.bin"));

        assert_eq!(classified.kind(), ErrorKind::LocalResource);
        assert!(classified.kind().is_local());
        assert!(classified.message().contains("disk full"));
        assert!(classified.message().contains("/tmp/out.bin"));
    }

    #[test]
    fn describe_falls_back_to_error_kind() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(describe_io_error(&err), "permission denied");

        let err = io::Error::other("weird");
        assert_eq!(describe_io_error(&err), "local I/O error");
    }
}
