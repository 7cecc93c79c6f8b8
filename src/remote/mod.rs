//! Contract for the messaging platform's RPC API.
//!
//! The wire protocol itself is not implemented here. Everything the transfer
//! core needs from the remote side goes through [`RemoteService`], obtained
//! from a [`Connector`]. Each call is tagged with an endpoint name from
//! [`endpoint`], which the rate-limit layer uses as its throttle scope.
//!
//! [`simulated`] provides an in-process implementation used by the test suite
//! and by the CLI's `--simulation` mode.

pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use simulated::{Fault, SimulatedConnector, SimulatedService};

/// Endpoint names, used as throttle scopes and in logs.
pub mod endpoint {
    pub const SIGN_IN: &str = "auth.signIn";
    pub const LOG_OUT: &str = "auth.logOut";
    pub const TAKEOUT_INIT: &str = "account.initTakeoutSession";
    pub const TAKEOUT_FINISH: &str = "account.finishTakeoutSession";
    pub const HISTORY: &str = "messages.getHistory";
    pub const GET_MESSAGES: &str = "messages.getMessages";
    pub const GET_FILE: &str = "upload.getFile";
    pub const SAVE_FILE_PART: &str = "upload.saveFilePart";
    pub const SEND_MEDIA: &str = "messages.sendMedia";
    pub const FORWARD: &str = "messages.forwardMessages";
}

/// Raw outcome of a failed remote call, before classification.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Connection reset, broken pipe, DC migration in progress.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote asks the client to wait before calling again. `scope` names
    /// the endpoint the directive applies to; `None` means every endpoint.
    #[error("flood wait of {}s", wait.as_secs())]
    Flood {
        wait: Duration,
        scope: Option<String>,
    },

    #[error("request rejected ({code:?}): {message}")]
    Rejected { code: RejectCode, message: String },

    #[error("session is not authorized: {0}")]
    Unauthorized(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The caller abandoned the call because the run was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// Fault raised inside the client itself (e.g. a panic while executing a call).
    #[error("internal client fault: {0}")]
    Internal(String),
}

impl RpcError {
    /// Network-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    NotFound,
    PermissionDenied,
    BadRequest,
}

/// Application identity presented when the session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    Desktop,
    Android,
    Ios,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Desktop => "desktop",
            AppType::Android => "android",
            AppType::Ios => "ios",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i32) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// Downloadable media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub file_id: i64,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageRef,
    pub date: DateTime<Utc>,
    pub text: String,
    /// Album identifier; messages sharing it were sent together.
    pub grouped_id: Option<i64>,
    pub media: Option<MediaInfo>,
}

/// One page request over a chat's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub chat_id: i64,
    /// Exclusive bound: messages strictly older (descending) or newer
    /// (ascending) than this id. `0` starts from the newest/oldest end.
    pub offset_id: i32,
    pub limit: u32,
    pub descending: bool,
}

/// A file whose parts have all been uploaded and can be attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub upload_id: i64,
    pub parts: u32,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Server-side forward, keeping the "forwarded from" header.
    #[default]
    Direct,
    /// Re-send the content as a new message.
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub from_chat: i64,
    pub ids: Vec<i32>,
    pub to_chat: i64,
    pub mode: ForwardMode,
    pub silent: bool,
    /// Replacement caption, only honored in clone mode.
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub phone: String,
    pub code: String,
    pub password: Option<String>,
}

/// Connection-level parameters, fixed when the session manager is built.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub proxy: Option<String>,
    /// Local clock correction in milliseconds (server time minus local time).
    pub clock_offset_ms: i64,
    pub reconnect_timeout: Duration,
    pub app: AppType,
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Vec<u8>, RpcError>;

    async fn restore_session(&self, session: &[u8]) -> Result<SessionInfo, RpcError>;

    /// Current session state, to be persisted after (re)authorization.
    async fn export_session(&self) -> Result<Vec<u8>, RpcError>;

    async fn log_out(&self) -> Result<(), RpcError>;

    /// Open a takeout session. Until it is finished the connection wraps
    /// every later call in it, which the remote rate-limits more loosely, so
    /// callers never pass the id to individual calls.
    async fn init_takeout(&self) -> Result<i64, RpcError>;

    async fn finish_takeout(&self, takeout_id: i64, success: bool) -> Result<(), RpcError>;

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<RemoteMessage>, RpcError>;

    async fn get_messages(&self, chat_id: i64, ids: &[i32])
    -> Result<Vec<RemoteMessage>, RpcError>;

    async fn download_chunk(
        &self,
        media: &MediaInfo,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<u8>, RpcError>;

    async fn upload_part(
        &self,
        upload_id: i64,
        part: u32,
        total_parts: u32,
        data: &[u8],
    ) -> Result<(), RpcError>;

    async fn send_media(
        &self,
        target: i64,
        file: &UploadedFile,
        as_photo: bool,
        caption: &str,
    ) -> Result<MessageRef, RpcError>;

    /// Forward a batch of messages from one chat. The outer error fails the
    /// whole batch; inner results report each id in request order.
    async fn forward(
        &self,
        request: &ForwardRequest,
    ) -> Result<Vec<Result<MessageRef, RpcError>>, RpcError>;

    /// Tear down the connection.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn RemoteService>, RpcError>;
}
