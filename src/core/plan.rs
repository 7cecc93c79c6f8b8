//! Transfer plans and their lazy expansion into work units.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::middleware::{Chain, RetryLedger};
use super::models::{Category, DownloadUnit, ForwardUnit, UploadUnit, WorkUnit};
use super::template::OutputTemplate;
use crate::error::TransferError;
use crate::remote::{
    ForwardMode, HistoryQuery, MessageRef, RemoteMessage, RemoteService, endpoint,
};

pub const HISTORY_PAGE_SIZE: u32 = 100;
pub const DEFAULT_CHUNK_SIZE: u32 = 512 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;
pub const CHUNK_ALIGN: u32 = 4 * 1024;
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("resume and restart cannot be combined")]
    ResumeAndRestart,
    #[error("concurrency must be between 1 and {MAX_CONCURRENCY}, got {0}")]
    Concurrency(usize),
    #[error("chunk size must be a non-zero multiple of 4 KiB up to 1 MiB, got {0}")]
    ChunkSize(u32),
    #[error("{selector} selector cannot feed a {category} plan")]
    SelectorMismatch {
        selector: &'static str,
        category: Category,
    },
    #[error("edit_text requires clone mode")]
    EditTextNeedsClone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

impl Order {
    pub fn is_descending(&self) -> bool {
        matches!(self, Order::Descending)
    }
}

/// Extension filters applied while the plan is expanded.
///
/// Matching is case-insensitive and ignores a leading dot; an extension that
/// is both included and excluded is excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

fn normalize_ext(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

fn ext_set<I>(items: I) -> HashSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    items
        .into_iter()
        .map(|e| normalize_ext(e.as_ref()))
        .filter(|e| !e.is_empty())
        .collect()
}

impl ExtFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Self {
            include: ext_set(include),
            exclude: ext_set(exclude),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// `None` means the unit carries no file (e.g. a text-only forward).
    pub fn allows(&self, file_name: Option<&str>) -> bool {
        let ext = file_name
            .and_then(|n| Path::new(n).extension())
            .map(|e| normalize_ext(&e.to_string_lossy()));

        match ext {
            Some(ext) if self.exclude.contains(&ext) => false,
            Some(ext) => self.include.is_empty() || self.include.contains(&ext),
            None => self.include.is_empty(),
        }
    }
}

/// Where the plan's units come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSelector {
    /// A chat's history, optionally bounded by inclusive message ids.
    ChatHistory {
        chat_id: i64,
        from_id: Option<i32>,
        to_id: Option<i32>,
    },
    /// Explicit message references.
    Messages(Vec<MessageRef>),
    /// Local files and directories, walked recursively.
    LocalFiles(Vec<PathBuf>),
    /// Pre-expanded units.
    Units(Vec<WorkUnit>),
}

impl UnitSelector {
    fn as_str(&self) -> &'static str {
        match self {
            UnitSelector::ChatHistory { .. } => "chat history",
            UnitSelector::Messages(_) => "message list",
            UnitSelector::LocalFiles(_) => "local files",
            UnitSelector::Units(_) => "unit list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub dir: PathBuf,
    pub template: OutputTemplate,
    /// Replace file extensions with the canonical one for the media type.
    pub rewrite_ext: bool,
    /// Treat an existing destination of the expected size as done.
    pub skip_same: bool,
    pub chunk_size: u32,
}

impl DownloadOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            template: OutputTemplate::default(),
            rewrite_ext: false,
            skip_same: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub target: i64,
    /// Send images as photos rather than documents.
    pub photo: bool,
    /// Delete the local file once the upload is done.
    pub remove_after: bool,
    pub caption: String,
    pub chunk_size: u32,
}

impl UploadOptions {
    pub fn new(target: i64) -> Self {
        Self {
            target,
            photo: false,
            remove_after: false,
            caption: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOptions {
    pub target: i64,
    pub mode: ForwardMode,
    /// Replacement caption; clone mode only.
    pub edit_text: Option<String>,
    pub silent: bool,
    /// Expand and report without calling the remote.
    pub dry_run: bool,
    /// Never batch, even when the plan asks for grouping.
    pub single: bool,
}

impl ForwardOptions {
    pub fn new(target: i64) -> Self {
        Self {
            target,
            mode: ForwardMode::Direct,
            edit_text: None,
            silent: false,
            dry_run: false,
            single: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOptions {
    Download(DownloadOptions),
    Upload(UploadOptions),
    Forward(ForwardOptions),
}

impl PlanOptions {
    pub fn category(&self) -> Category {
        match self {
            PlanOptions::Download(_) => Category::Download,
            PlanOptions::Upload(_) => Category::Upload,
            PlanOptions::Forward(_) => Category::Forward,
        }
    }
}

/// A caller's request. Immutable once scheduling starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub selector: UnitSelector,
    pub options: PlanOptions,
    pub filter: ExtFilter,
    pub order: Order,
    /// Worker pool size; chunk sub-transfers share the same budget.
    pub concurrency: usize,
    /// Continue partially transferred units from their committed offset.
    pub resume: bool,
    /// Forget this category's history before running.
    pub restart: bool,
    /// Batch units bound for the same target where the remote allows it.
    pub group: bool,
}

impl TransferPlan {
    pub fn new(selector: UnitSelector, options: PlanOptions) -> Self {
        Self {
            selector,
            options,
            filter: ExtFilter::default(),
            order: Order::default(),
            concurrency: 4,
            resume: false,
            restart: false,
            group: false,
        }
    }

    pub fn category(&self) -> Category {
        self.options.category()
    }

    /// Whether units are batched. Only forwards support it.
    pub fn grouping(&self) -> bool {
        match &self.options {
            PlanOptions::Forward(opts) => self.group && !opts.single,
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.resume && self.restart {
            return Err(PlanError::ResumeAndRestart);
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(PlanError::Concurrency(self.concurrency));
        }

        let chunk_size = match &self.options {
            PlanOptions::Download(o) => Some(o.chunk_size),
            PlanOptions::Upload(o) => Some(o.chunk_size),
            PlanOptions::Forward(o) => {
                if o.edit_text.is_some() && o.mode != ForwardMode::Clone {
                    return Err(PlanError::EditTextNeedsClone);
                }
                None
            }
        };
        if let Some(size) = chunk_size {
            validate_chunk_size(size)?;
        }

        let fits = match (&self.selector, self.category()) {
            (UnitSelector::Units(units), category) => {
                units.iter().all(|u| u.category() == category)
            }
            (UnitSelector::LocalFiles(_), category) => category == Category::Upload,
            (_, category) => category != Category::Upload,
        };
        if !fits {
            return Err(PlanError::SelectorMismatch {
                selector: self.selector.as_str(),
                category: self.category(),
            });
        }
        Ok(())
    }
}

pub fn validate_chunk_size(size: u32) -> Result<(), PlanError> {
    if size == 0 || size % CHUNK_ALIGN != 0 || size > MAX_CHUNK_SIZE {
        return Err(PlanError::ChunkSize(size));
    }
    Ok(())
}

/// Turn a remote message into the plan's unit type, if it qualifies.
fn unit_for_message(plan: &TransferPlan, message: RemoteMessage) -> Option<WorkUnit> {
    match &plan.options {
        PlanOptions::Download(_) => {
            let media = message.media.clone()?;
            if !plan.filter.allows(Some(&media.name)) {
                return None;
            }
            Some(WorkUnit::Download(DownloadUnit { message, media }))
        }
        PlanOptions::Forward(opts) => {
            let media_name = message.media.as_ref().map(|m| m.name.clone());
            if !plan.filter.allows(media_name.as_deref()) {
                return None;
            }
            Some(WorkUnit::Forward(ForwardUnit {
                source: message.id,
                target: opts.target,
                grouped_id: message.grouped_id,
                media_name,
            }))
        }
        PlanOptions::Upload(_) => None,
    }
}

/// Hold a slot of the run's concurrency budget while a listing call is in
/// flight, so expansion counts against the same limit as the workers.
async fn listing_permit(
    permits: Option<&Semaphore>,
) -> Result<Option<SemaphorePermit<'_>>, TransferError> {
    match permits {
        Some(semaphore) => semaphore
            .acquire()
            .await
            .map(Some)
            .map_err(|_| TransferError::cancelled()),
        None => Ok(None),
    }
}

/// Remote listing shared by the expansion helpers.
#[derive(Clone, Copy)]
struct Lister<'a> {
    service: &'a Arc<dyn RemoteService>,
    chain: &'a Chain,
    ledger: &'a RetryLedger,
    permits: Option<&'a Semaphore>,
}

fn into_units<'a>(
    plan: &'a TransferPlan,
    pages: BoxStream<'a, Result<Vec<RemoteMessage>, TransferError>>,
) -> BoxStream<'a, Result<WorkUnit, TransferError>> {
    pages
        .flat_map(move |page| {
            let items: Vec<Result<WorkUnit, TransferError>> = match page {
                Ok(messages) => messages
                    .into_iter()
                    .filter_map(|m| unit_for_message(plan, m))
                    .map(Ok)
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
}

/// Expand `plan` into units in its declared order, fetching history pages
/// and walking directories only as the consumer asks for more.
///
/// When `permits` is given, each listing call holds one slot of it.
pub fn expand<'a>(
    plan: &'a TransferPlan,
    service: &'a Arc<dyn RemoteService>,
    chain: &'a Chain,
    ledger: &'a RetryLedger,
    permits: Option<&'a Semaphore>,
) -> BoxStream<'a, Result<WorkUnit, TransferError>> {
    let lister = Lister {
        service,
        chain,
        ledger,
        permits,
    };

    match &plan.selector {
        UnitSelector::ChatHistory {
            chat_id,
            from_id,
            to_id,
        } => {
            let range = HistoryRange {
                chat_id: *chat_id,
                from_id: *from_id,
                to_id: *to_id,
            };
            into_units(plan, history_pages(range, plan.order, lister))
        }

        UnitSelector::Messages(refs) => {
            into_units(plan, message_batches(refs, plan.order, lister))
        }

        UnitSelector::LocalFiles(paths) => {
            let PlanOptions::Upload(opts) = &plan.options else {
                return stream::empty().boxed();
            };
            walk_files(paths.clone(), plan.order)
                .filter_map(move |entry| {
                    let item = match entry {
                        Ok((path, size)) => {
                            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                            plan.filter.allows(name.as_deref()).then(|| {
                                Ok(WorkUnit::Upload(UploadUnit {
                                    path,
                                    size,
                                    target: opts.target,
                                }))
                            })
                        }
                        Err(e) => Some(Err(e)),
                    };
                    futures::future::ready(item)
                })
                .boxed()
        }

        UnitSelector::Units(units) => {
            let mut units = units.clone();
            if plan.order.is_descending() {
                units.reverse();
            }
            stream::iter(
                units
                    .into_iter()
                    .filter(|u| plan.filter.allows(u.file_name().as_deref()))
                    .map(Ok),
            )
            .boxed()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HistoryRange {
    chat_id: i64,
    /// Inclusive lower bound.
    from_id: Option<i32>,
    /// Inclusive upper bound.
    to_id: Option<i32>,
}

impl HistoryRange {
    fn contains(&self, message_id: i32) -> bool {
        self.from_id.is_none_or(|f| message_id >= f) && self.to_id.is_none_or(|t| message_id <= t)
    }
}

struct HistoryCursor {
    offset_id: i32,
    finished: bool,
}

fn history_pages<'a>(
    range: HistoryRange,
    order: Order,
    lister: Lister<'a>,
) -> BoxStream<'a, Result<Vec<RemoteMessage>, TransferError>> {
    let descending = order.is_descending();
    let start = HistoryCursor {
        offset_id: if descending {
            range.to_id.map(|t| t.saturating_add(1)).unwrap_or(0)
        } else {
            range.from_id.map(|f| f.saturating_sub(1)).unwrap_or(0)
        },
        finished: false,
    };

    stream::unfold(start, move |cursor| async move {
        if cursor.finished {
            return None;
        }

        let query = HistoryQuery {
            chat_id: range.chat_id,
            offset_id: cursor.offset_id,
            limit: HISTORY_PAGE_SIZE,
            descending,
        };
        let fetched = match listing_permit(lister.permits).await {
            Ok(_permit) => {
                lister
                    .chain
                    .invoke(endpoint::HISTORY, lister.ledger, || {
                        lister.service.history(&query)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                let stop = HistoryCursor {
                    offset_id: cursor.offset_id,
                    finished: true,
                };
                return Some((Err(e), stop));
            }
        };

        let last = page.last().map(|m| m.id.message_id)?;
        let short_page = page.len() < HISTORY_PAGE_SIZE as usize;
        let crossed_bound = page.iter().any(|m| !range.contains(m.id.message_id));
        let messages: Vec<RemoteMessage> = page
            .into_iter()
            .filter(|m| range.contains(m.id.message_id))
            .collect();

        let next = HistoryCursor {
            offset_id: last,
            finished: short_page || crossed_bound,
        };
        Some((Ok(messages), next))
    })
    .boxed()
}

fn message_batches<'a>(
    refs: &[MessageRef],
    order: Order,
    lister: Lister<'a>,
) -> BoxStream<'a, Result<Vec<RemoteMessage>, TransferError>> {
    let mut by_chat: BTreeMap<i64, Vec<i32>> = BTreeMap::new();
    for r in refs {
        by_chat.entry(r.chat_id).or_default().push(r.message_id);
    }

    let mut chats: Vec<(i64, Vec<i32>)> = by_chat.into_iter().collect();
    if order.is_descending() {
        chats.reverse();
    }

    let mut batches: Vec<(i64, Vec<i32>)> = Vec::new();
    for (chat_id, mut ids) in chats {
        ids.sort_unstable();
        ids.dedup();
        if order.is_descending() {
            ids.reverse();
        }
        for chunk in ids.chunks(HISTORY_PAGE_SIZE as usize) {
            batches.push((chat_id, chunk.to_vec()));
        }
    }

    stream::iter(batches)
        .then(move |(chat_id, ids)| async move {
            let _permit = listing_permit(lister.permits).await?;
            let mut messages = lister
                .chain
                .invoke(endpoint::GET_MESSAGES, lister.ledger, || {
                    lister.service.get_messages(chat_id, &ids)
                })
                .await?;
            messages.sort_by_key(|m| m.id.message_id);
            if order.is_descending() {
                messages.reverse();
            }
            Ok(messages)
        })
        .boxed()
}

/// Depth-first walk yielding `(path, size)` for every regular file, with
/// directory entries visited in name order (reversed when descending).
fn walk_files(
    roots: Vec<PathBuf>,
    order: Order,
) -> BoxStream<'static, Result<(PathBuf, u64), TransferError>> {
    let mut pending = roots;
    pending.reverse();

    stream::unfold(pending, move |mut pending| async move {
        loop {
            let path = pending.pop()?;
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) => return Some((Err(TransferError::local(&e, &path)), pending)),
            };

            if meta.is_file() {
                return Some((Ok((path, meta.len())), pending));
            }
            if !meta.is_dir() {
                continue;
            }

            let mut children = Vec::new();
            let mut entries = match tokio::fs::read_dir(&path).await {
                Ok(entries) => entries,
                Err(e) => return Some((Err(TransferError::local(&e, &path)), pending)),
            };
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => children.push(entry.path()),
                    Ok(None) => break,
                    Err(e) => return Some((Err(TransferError::local(&e, &path)), pending)),
                }
            }
            children.sort();
            if !order.is_descending() {
                children.reverse();
            }
            pending.extend(children);
        }
    })
    .boxed()
}
