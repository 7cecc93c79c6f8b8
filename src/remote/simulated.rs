//! In-process stand-in for the remote platform.
//!
//! Keeps chats, files and uploads in memory, records every call with its
//! (tokio) timestamp, tracks how many calls are in flight at once and lets
//! callers queue faults per endpoint. Used by the test suite and by the CLI
//! when started with `--simulation`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::{Instant, sleep};

use super::{
    ConnectOptions, Connector, Credentials, ForwardMode, ForwardRequest, HistoryQuery, MediaInfo,
    MessageRef, RejectCode, RemoteMessage, RemoteService, RpcError, SessionInfo, UploadedFile,
    endpoint,
};

const SESSION_PREFIX: &str = "sim-session:";

/// A failure to return from the next call to an endpoint.
#[derive(Debug, Clone)]
pub enum Fault {
    Transient,
    /// Flood directive applying to every endpoint.
    Flood(Duration),
    /// Flood directive scoped to the endpoint that raised it.
    ScopedFlood(Duration),
    Reject(RejectCode),
    Unauthorized,
    /// Panic inside the call.
    Panic,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub endpoint: &'static str,
    pub at: Instant,
    /// Takeout session the call was wrapped in, if one was open.
    pub takeout: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SentMedia {
    pub target: i64,
    pub message: MessageRef,
    pub name: String,
    pub content: Vec<u8>,
    pub as_photo: bool,
    pub caption: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: RemoteMessage,
}

#[derive(Default)]
struct SimState {
    chats: BTreeMap<i64, BTreeMap<i32, StoredMessage>>,
    files: HashMap<i64, Vec<u8>>,
    next_file_id: i64,
    faults: HashMap<String, VecDeque<Fault>>,
    member_failures: HashMap<MessageRef, u32>,
    calls: Vec<CallRecord>,
    uploads: HashMap<i64, BTreeMap<u32, Vec<u8>>>,
    sent: Vec<SentMedia>,
    forwards: Vec<ForwardRequest>,
    open_takeouts: HashSet<i64>,
    finished_takeouts: Vec<(i64, bool)>,
    next_takeout: i64,
    revoked: bool,
    logged_out: bool,
    session_user: Option<i64>,
    closes: usize,
}

pub struct SimulatedService {
    state: Mutex<SimState>,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for SimulatedService {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge when a call finishes (or is dropped).
struct ActiveCall<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn message_date(id: i32) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    base + chrono::Duration::minutes(i64::from(id))
}

/// Deterministic pseudo-random bytes for seeded files.
pub fn sample_content(seed: i64, size: usize) -> Vec<u8> {
    let mut state = (seed as u64).wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..size)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

impl SimulatedService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_file_id: 1,
                next_takeout: 1,
                ..SimState::default()
            }),
            latency: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A few chats full of media, for `--simulation` runs.
    pub fn seed_demo(&self) {
        for chat_id in [1001_i64, 1002] {
            for i in 0..12_i64 {
                let size = 48 * 1024 + (i as usize * 97 * 1024) % (2 * 1024 * 1024);
                let (name, mime) = if i % 3 == 0 {
                    (format!("photo_{i}.jpg"), "image/jpeg")
                } else if i % 3 == 1 {
                    (format!("clip_{i}.mp4"), "video/mp4")
                } else {
                    (format!("notes_{i}.pdf"), "application/pdf")
                };
                let grouped = (i % 4 == 0).then_some(chat_id * 100 + i / 4);
                self.add_media_message(
                    chat_id,
                    &name,
                    mime,
                    sample_content(chat_id * 1000 + i, size),
                    grouped,
                );
            }
            self.add_text_message(chat_id, "no media here");
        }
    }

    pub fn add_media_message(
        &self,
        chat_id: i64,
        name: &str,
        mime_type: &str,
        content: Vec<u8>,
        grouped_id: Option<i64>,
    ) -> RemoteMessage {
        let mut state = self.state();
        let file_id = state.next_file_id;
        state.next_file_id += 1;
        let media = MediaInfo {
            file_id,
            name: name.to_string(),
            size: content.len() as u64,
            mime_type: mime_type.to_string(),
        };
        state.files.insert(file_id, content);
        insert_message(&mut state, chat_id, String::new(), grouped_id, Some(media))
    }

    pub fn add_text_message(&self, chat_id: i64, text: &str) -> RemoteMessage {
        let mut state = self.state();
        insert_message(&mut state, chat_id, text.to_string(), None, None)
    }

    /// Queue a fault for the next call to `endpoint`.
    pub fn inject(&self, endpoint: &str, fault: Fault) {
        self.state()
            .faults
            .entry(endpoint.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Make `message` fail inside forward batches for the next `times` attempts.
    pub fn fail_forward_member(&self, message: MessageRef, times: u32) {
        self.state().member_failures.insert(message, times);
    }

    /// Invalidate every session: all subsequent calls answer `Unauthorized`.
    pub fn revoke_sessions(&self) {
        self.state().revoked = true;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    /// Highest number of calls observed in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn sent_media(&self) -> Vec<SentMedia> {
        self.state().sent.clone()
    }

    pub fn forwards(&self) -> Vec<ForwardRequest> {
        self.state().forwards.clone()
    }

    pub fn messages(&self, chat_id: i64) -> Vec<RemoteMessage> {
        self.state()
            .chats
            .get(&chat_id)
            .map(|m| m.values().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn file_content(&self, file_id: i64) -> Option<Vec<u8>> {
        self.state().files.get(&file_id).cloned()
    }

    pub fn finished_takeouts(&self) -> Vec<(i64, bool)> {
        self.state().finished_takeouts.clone()
    }

    pub fn open_takeouts(&self) -> usize {
        self.state().open_takeouts.len()
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    /// Record the call, mark it in flight, wait out the latency and apply
    /// any queued fault.
    async fn enter(&self, endpoint: &'static str) -> Result<ActiveCall<'_>, RpcError> {
        let fault = {
            let mut state = self.state();
            let takeout = state.open_takeouts.iter().max().copied();
            state.calls.push(CallRecord {
                endpoint,
                at: Instant::now(),
                takeout,
            });
            let fault = state.faults.get_mut(endpoint).and_then(|q| q.pop_front());
            if fault.is_none() && state.revoked && endpoint != endpoint::SIGN_IN {
                Some(Fault::Unauthorized)
            } else {
                fault
            }
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveCall {
            active: &self.active,
        };

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        match fault {
            None => Ok(guard),
            Some(Fault::Transient) => Err(RpcError::Transport("connection reset by peer".into())),
            Some(Fault::Flood(wait)) => Err(RpcError::Flood { wait, scope: None }),
            Some(Fault::ScopedFlood(wait)) => Err(RpcError::Flood {
                wait,
                scope: Some(endpoint.to_string()),
            }),
            Some(Fault::Reject(code)) => Err(RpcError::Rejected {
                code,
                message: format!("{endpoint} rejected"),
            }),
            Some(Fault::Unauthorized) => Err(RpcError::Unauthorized("AUTH_KEY_UNREGISTERED".into())),
            Some(Fault::Panic) => panic!("simulated fault inside {endpoint}"),
        }
    }
}

fn insert_message(
    state: &mut SimState,
    chat_id: i64,
    text: String,
    grouped_id: Option<i64>,
    media: Option<MediaInfo>,
) -> RemoteMessage {
    let chat = state.chats.entry(chat_id).or_default();
    let id = chat.keys().next_back().copied().unwrap_or(0) + 1;
    let message = RemoteMessage {
        id: MessageRef::new(chat_id, id),
        date: message_date(id),
        text,
        grouped_id,
        media,
    };
    chat.insert(
        id,
        StoredMessage {
            message: message.clone(),
        },
    );
    message
}

fn parse_session(session: &[u8]) -> Option<i64> {
    std::str::from_utf8(session)
        .ok()?
        .strip_prefix(SESSION_PREFIX)?
        .parse()
        .ok()
}

#[async_trait]
impl RemoteService for SimulatedService {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Vec<u8>, RpcError> {
        let _call = self.enter(endpoint::SIGN_IN).await?;
        if credentials.code.is_empty() {
            return Err(RpcError::Rejected {
                code: RejectCode::BadRequest,
                message: "PHONE_CODE_EMPTY".into(),
            });
        }
        let digits: String = credentials.phone.chars().filter(char::is_ascii_digit).collect();
        let user_id = digits.parse::<i64>().unwrap_or(1);
        let mut state = self.state();
        state.revoked = false;
        state.logged_out = false;
        state.session_user = Some(user_id);
        Ok(format!("{SESSION_PREFIX}{user_id}").into_bytes())
    }

    async fn restore_session(&self, session: &[u8]) -> Result<SessionInfo, RpcError> {
        let _call = self.enter(endpoint::SIGN_IN).await?;
        if self.state().revoked {
            return Err(RpcError::Unauthorized("SESSION_REVOKED".into()));
        }
        let user_id = parse_session(session)
            .ok_or_else(|| RpcError::Unauthorized("AUTH_KEY_INVALID".into()))?;
        self.state().session_user = Some(user_id);
        Ok(SessionInfo {
            user_id,
            username: Some(format!("user{user_id}")),
        })
    }

    async fn export_session(&self) -> Result<Vec<u8>, RpcError> {
        let state = self.state();
        match state.session_user {
            Some(user_id) if !state.revoked && !state.logged_out => {
                Ok(format!("{SESSION_PREFIX}{user_id}").into_bytes())
            }
            _ => Err(RpcError::Unauthorized("AUTH_KEY_UNREGISTERED".into())),
        }
    }

    async fn log_out(&self) -> Result<(), RpcError> {
        let _call = self.enter(endpoint::LOG_OUT).await?;
        self.state().logged_out = true;
        Ok(())
    }

    async fn init_takeout(&self) -> Result<i64, RpcError> {
        let _call = self.enter(endpoint::TAKEOUT_INIT).await?;
        let mut state = self.state();
        let id = state.next_takeout;
        state.next_takeout += 1;
        state.open_takeouts.insert(id);
        Ok(id)
    }

    async fn finish_takeout(&self, takeout_id: i64, success: bool) -> Result<(), RpcError> {
        let _call = self.enter(endpoint::TAKEOUT_FINISH).await?;
        let mut state = self.state();
        if !state.open_takeouts.remove(&takeout_id) {
            return Err(RpcError::Rejected {
                code: RejectCode::BadRequest,
                message: "TAKEOUT_INVALID".into(),
            });
        }
        state.finished_takeouts.push((takeout_id, success));
        Ok(())
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<RemoteMessage>, RpcError> {
        let _call = self.enter(endpoint::HISTORY).await?;
        let state = self.state();
        let chat = state.chats.get(&query.chat_id).ok_or(RpcError::Rejected {
            code: RejectCode::NotFound,
            message: "CHANNEL_INVALID".into(),
        })?;

        let limit = query.limit as usize;
        let page: Vec<RemoteMessage> = if query.descending {
            chat.values()
                .rev()
                .filter(|m| query.offset_id == 0 || m.message.id.message_id < query.offset_id)
                .take(limit)
                .map(|m| m.message.clone())
                .collect()
        } else {
            chat.values()
                .filter(|m| m.message.id.message_id > query.offset_id)
                .take(limit)
                .map(|m| m.message.clone())
                .collect()
        };
        Ok(page)
    }

    async fn get_messages(
        &self,
        chat_id: i64,
        ids: &[i32],
    ) -> Result<Vec<RemoteMessage>, RpcError> {
        let _call = self.enter(endpoint::GET_MESSAGES).await?;
        let state = self.state();
        let Some(chat) = state.chats.get(&chat_id) else {
            return Err(RpcError::Rejected {
                code: RejectCode::NotFound,
                message: "CHANNEL_INVALID".into(),
            });
        };
        Ok(ids
            .iter()
            .filter_map(|id| chat.get(id).map(|m| m.message.clone()))
            .collect())
    }

    async fn download_chunk(
        &self,
        media: &MediaInfo,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<u8>, RpcError> {
        let _call = self.enter(endpoint::GET_FILE).await?;
        let state = self.state();
        let content = state.files.get(&media.file_id).ok_or(RpcError::Rejected {
            code: RejectCode::NotFound,
            message: "FILE_REFERENCE_INVALID".into(),
        })?;
        let start = (offset as usize).min(content.len());
        let end = (start + limit as usize).min(content.len());
        Ok(content[start..end].to_vec())
    }

    async fn upload_part(
        &self,
        upload_id: i64,
        part: u32,
        total_parts: u32,
        data: &[u8],
    ) -> Result<(), RpcError> {
        let _call = self.enter(endpoint::SAVE_FILE_PART).await?;
        if part >= total_parts {
            return Err(RpcError::Rejected {
                code: RejectCode::BadRequest,
                message: "FILE_PART_INVALID".into(),
            });
        }
        self.state()
            .uploads
            .entry(upload_id)
            .or_default()
            .insert(part, data.to_vec());
        Ok(())
    }

    async fn send_media(
        &self,
        target: i64,
        file: &UploadedFile,
        as_photo: bool,
        caption: &str,
    ) -> Result<MessageRef, RpcError> {
        let _call = self.enter(endpoint::SEND_MEDIA).await?;
        let mut state = self.state();
        let parts = state.uploads.remove(&file.upload_id).unwrap_or_default();
        if parts.len() != file.parts as usize || (0..file.parts).any(|p| !parts.contains_key(&p))
        {
            return Err(RpcError::Rejected {
                code: RejectCode::BadRequest,
                message: "FILE_PARTS_INVALID".into(),
            });
        }
        let content: Vec<u8> = parts.into_values().flatten().collect();
        if content.len() as u64 != file.size {
            return Err(RpcError::Rejected {
                code: RejectCode::BadRequest,
                message: "FILE_PARTS_INVALID".into(),
            });
        }

        let file_id = state.next_file_id;
        state.next_file_id += 1;
        state.files.insert(file_id, content.clone());
        let mime = if as_photo { "image/jpeg" } else { "application/octet-stream" };
        let media = MediaInfo {
            file_id,
            name: file.name.clone(),
            size: file.size,
            mime_type: mime.to_string(),
        };
        let message = insert_message(&mut state, target, caption.to_string(), None, Some(media));
        state.sent.push(SentMedia {
            target,
            message: message.id,
            name: file.name.clone(),
            content,
            as_photo,
            caption: caption.to_string(),
        });
        Ok(message.id)
    }

    async fn forward(
        &self,
        request: &ForwardRequest,
    ) -> Result<Vec<Result<MessageRef, RpcError>>, RpcError> {
        let _call = self.enter(endpoint::FORWARD).await?;
        let mut state = self.state();
        state.forwards.push(request.clone());

        let mut results = Vec::with_capacity(request.ids.len());
        for id in &request.ids {
            let source = MessageRef::new(request.from_chat, *id);
            if let Some(remaining) = state.member_failures.get_mut(&source) {
                if *remaining > 0 {
                    *remaining -= 1;
                    results.push(Err(RpcError::Rejected {
                        code: RejectCode::BadRequest,
                        message: "MEDIA_EMPTY".into(),
                    }));
                    continue;
                }
            }

            let original = state
                .chats
                .get(&request.from_chat)
                .and_then(|c| c.get(id))
                .map(|m| m.message.clone());
            let Some(original) = original else {
                results.push(Err(RpcError::Rejected {
                    code: RejectCode::NotFound,
                    message: "MESSAGE_ID_INVALID".into(),
                }));
                continue;
            };

            let text = match (request.mode, &request.caption) {
                (ForwardMode::Clone, Some(caption)) => caption.clone(),
                _ => original.text.clone(),
            };
            let copy = insert_message(
                &mut state,
                request.to_chat,
                text,
                original.grouped_id,
                original.media.clone(),
            );
            results.push(Ok(copy.id));
        }
        Ok(results)
    }

    async fn close(&self) {
        self.state().closes += 1;
    }
}

/// Hands out the same shared [`SimulatedService`] on every connect.
pub struct SimulatedConnector {
    service: Arc<SimulatedService>,
    connect_delay: Duration,
    connects: AtomicUsize,
    last_options: Mutex<Option<ConnectOptions>>,
}

impl SimulatedConnector {
    pub fn new(service: Arc<SimulatedService>) -> Self {
        Self {
            service,
            connect_delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    /// Delay every connection attempt (to exercise the reconnect timeout).
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn service(&self) -> Arc<SimulatedService> {
        Arc::clone(&self.service)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn RemoteService>, RpcError> {
        if !self.connect_delay.is_zero() {
            sleep(self.connect_delay).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());
        let service: Arc<dyn RemoteService> = self.service.clone();
        Ok(service)
    }
}
