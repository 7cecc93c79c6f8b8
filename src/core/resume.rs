//! Per-unit progress records used for resume and deduplication.
//!
//! Records live under `dedup:<category>:<fingerprint>` in the account's
//! namespace, one logical table per category.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::Category;
use crate::error::{ErrorKind, StorageError, TransferError};
use crate::storage::{Namespace, get_json, keys, set_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Record {
    Partial {
        /// Bytes committed to the destination so far.
        offset: u64,
        /// Source size observed when the offset was committed.
        size: u64,
        /// Remote-side handle needed to continue (upload id).
        handle: Option<i64>,
        updated_at: DateTime<Utc>,
    },
    Done {
        size: u64,
        completed_at: DateTime<Utc>,
    },
    Failed {
        kind: ErrorKind,
        reason: String,
        offset: u64,
        size: u64,
        handle: Option<i64>,
        failed_at: DateTime<Utc>,
    },
}

/// Where a previous run left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialState {
    pub offset: u64,
    pub handle: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Unknown,
    Partial(PartialState),
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub done: usize,
    pub partial: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ResumeStore {
    ns: Arc<dyn Namespace>,
}

impl ResumeStore {
    pub fn new(ns: Arc<dyn Namespace>) -> Self {
        Self { ns }
    }

    pub async fn record(
        &self,
        category: Category,
        fingerprint: &str,
    ) -> Result<Option<Record>, StorageError> {
        get_json(self.ns.as_ref(), &keys::dedup(category, fingerprint)).await
    }

    /// Status for a unit whose source currently has `observed_size` bytes.
    ///
    /// A stored offset taken against a different size is not trusted: the
    /// unit is reported as [`UnitStatus::Unknown`] and restarts from zero.
    pub async fn status(
        &self,
        category: Category,
        fingerprint: &str,
        observed_size: u64,
    ) -> Result<UnitStatus, StorageError> {
        let status = match self.record(category, fingerprint).await? {
            None => UnitStatus::Unknown,
            Some(Record::Done { .. }) => UnitStatus::Done,
            Some(Record::Partial {
                offset,
                size,
                handle,
                ..
            })
            | Some(Record::Failed {
                offset,
                size,
                handle,
                ..
            }) => {
                if size != observed_size {
                    debug!(
                        fingerprint,
                        stored = size,
                        observed = observed_size,
                        "Source size changed; discarding stored offset"
                    );
                    UnitStatus::Unknown
                } else if offset == 0 && handle.is_none() {
                    UnitStatus::Unknown
                } else {
                    UnitStatus::Partial(PartialState { offset, handle })
                }
            }
        };
        Ok(status)
    }

    pub async fn mark_done(
        &self,
        category: Category,
        fingerprint: &str,
        size: u64,
    ) -> Result<(), StorageError> {
        let record = Record::Done {
            size,
            completed_at: Utc::now(),
        };
        set_json(self.ns.as_ref(), &keys::dedup(category, fingerprint), &record).await
    }

    pub async fn mark_partial(
        &self,
        category: Category,
        fingerprint: &str,
        offset: u64,
        size: u64,
        handle: Option<i64>,
    ) -> Result<(), StorageError> {
        let record = Record::Partial {
            offset,
            size,
            handle,
            updated_at: Utc::now(),
        };
        set_json(self.ns.as_ref(), &keys::dedup(category, fingerprint), &record).await
    }

    /// Record a terminal failure, keeping any committed offset so a later
    /// resume can continue from it.
    pub async fn mark_failed(
        &self,
        category: Category,
        fingerprint: &str,
        err: &TransferError,
        size: u64,
    ) -> Result<(), StorageError> {
        let (offset, handle) = match self.record(category, fingerprint).await? {
            Some(Record::Partial {
                offset,
                size: stored,
                handle,
                ..
            })
            | Some(Record::Failed {
                offset,
                size: stored,
                handle,
                ..
            }) if stored == size => (offset, handle),
            _ => (0, None),
        };

        let record = Record::Failed {
            kind: err.kind(),
            reason: err.message().to_string(),
            offset,
            size,
            handle,
            failed_at: Utc::now(),
        };
        set_json(self.ns.as_ref(), &keys::dedup(category, fingerprint), &record).await
    }

    /// Drop one category's table. Returns the number of records removed.
    pub async fn clear(&self, category: Category) -> Result<usize, StorageError> {
        let entries = self.ns.scan_prefix(&keys::dedup_table(category)).await?;
        let mut removed = 0;
        for (key, _) in entries {
            match self.ns.delete(&key).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Drop every category's table in this namespace.
    pub async fn clear_all(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for category in Category::ALL {
            removed += self.clear(category).await?;
        }
        Ok(removed)
    }

    pub async fn entries(&self, category: Category) -> Result<Vec<(String, Record)>, StorageError> {
        let prefix = keys::dedup_table(category);
        let mut out = Vec::new();
        for (key, value) in self.ns.scan_prefix(&prefix).await? {
            let fingerprint = key[prefix.len()..].to_string();
            out.push((fingerprint, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    pub async fn counts(&self, category: Category) -> Result<TableCounts, StorageError> {
        let mut counts = TableCounts::default();
        for (_, record) in self.entries(category).await? {
            match record {
                Record::Done { .. } => counts.done += 1,
                Record::Partial { .. } => counts.partial += 1,
                Record::Failed { .. } => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
