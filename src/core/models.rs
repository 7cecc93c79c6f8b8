use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TransferError};
use crate::remote::{MediaInfo, MessageRef, RemoteMessage};

/// Transfer direction. Each category has its own dedup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Download,
    Upload,
    Forward,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Download, Category::Upload, Category::Forward];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Download => "download",
            Category::Upload => "upload",
            Category::Forward => "forward",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadUnit {
    pub message: RemoteMessage,
    pub media: MediaInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUnit {
    pub path: PathBuf,
    pub size: u64,
    pub target: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardUnit {
    pub source: MessageRef,
    pub target: i64,
    pub grouped_id: Option<i64>,
    /// Name of the attached media, if any (used by extension filters).
    pub media_name: Option<String>,
}

/// One indivisible piece of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    Download(DownloadUnit),
    Upload(UploadUnit),
    Forward(ForwardUnit),
}

impl WorkUnit {
    pub fn category(&self) -> Category {
        match self {
            WorkUnit::Download(_) => Category::Download,
            WorkUnit::Upload(_) => Category::Upload,
            WorkUnit::Forward(_) => Category::Forward,
        }
    }

    /// Human-readable label for logs and progress events.
    pub fn name(&self) -> String {
        match self {
            WorkUnit::Download(u) => format!(
                "{}/{} {}",
                u.message.id.chat_id, u.message.id.message_id, u.media.name
            ),
            WorkUnit::Upload(u) => u.path.display().to_string(),
            WorkUnit::Forward(u) => format!(
                "{}/{} -> {}",
                u.source.chat_id, u.source.message_id, u.target
            ),
        }
    }

    /// Bytes this unit moves; forwards carry no payload of their own.
    pub fn total_bytes(&self) -> u64 {
        match self {
            WorkUnit::Download(u) => u.media.size,
            WorkUnit::Upload(u) => u.size,
            WorkUnit::Forward(_) => 0,
        }
    }

    /// File name used by extension filters.
    pub fn file_name(&self) -> Option<String> {
        match self {
            WorkUnit::Download(u) => Some(u.media.name.clone()),
            WorkUnit::Upload(u) => u
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            WorkUnit::Forward(u) => u.media_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Fingerprint already recorded as done.
    AlreadyDone,
    /// Destination already exists with the expected size.
    SameFileExists,
    DryRun,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyDone => "already done",
            SkipReason::SameFileExists => "same file exists",
            SkipReason::DryRun => "dry run",
        }
    }
}

/// Terminal state of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Done { bytes: u64 },
    Skipped { reason: SkipReason },
    Failed { kind: ErrorKind, reason: String },
}

impl UnitOutcome {
    pub fn failed(err: &TransferError) -> Self {
        UnitOutcome::Failed {
            kind: err.kind(),
            reason: err.message().to_string(),
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        UnitOutcome::Skipped { reason }
    }

    /// Whether the fingerprint should be persisted as done.
    pub fn completes(&self) -> bool {
        matches!(
            self,
            UnitOutcome::Done { .. }
                | UnitOutcome::Skipped {
                    reason: SkipReason::SameFileExists
                }
        )
    }
}

/// Byte-level progress of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub unit_index: usize,
    pub unit_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second over the last flush interval.
    pub speed_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Started {
        unit_index: usize,
        unit_name: String,
        total_bytes: u64,
    },
    /// Lossy under backpressure, except for a unit's final byte count.
    Progress(ProgressEvent),
    Finished {
        unit_index: usize,
        unit_name: String,
        fingerprint: String,
        outcome: UnitOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub unit_index: usize,
    pub unit_name: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Per-category result of one scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub category: Category,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub failures: Vec<UnitFailure>,
    /// The run stopped early on the shared cancellation signal.
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            done: 0,
            skipped: 0,
            failed: 0,
            bytes: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
            cancelled: false,
        }
    }

    pub fn total(&self) -> usize {
        self.done + self.skipped + self.failed
    }

    pub fn record(&mut self, unit_index: usize, unit_name: &str, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Done { bytes } => {
                self.done += 1;
                self.bytes += bytes;
            }
            UnitOutcome::Skipped { .. } => self.skipped += 1,
            UnitOutcome::Failed { kind, reason } => {
                self.failed += 1;
                self.failures.push(UnitFailure {
                    unit_index,
                    unit_name: unit_name.to_string(),
                    kind: *kind,
                    reason: reason.clone(),
                });
            }
        }
    }
}
