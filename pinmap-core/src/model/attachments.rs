//! src/model/attachments.rs
//! ============================================================================
//! # Deferred attachment queue
//!
//! Files the user drops onto a dialog before the owning record has a durable
//! id. Each owner key has its own FIFO batch; [`AttachmentQueue::drain`]
//! removes a whole batch in one critical section so a batch is handed to the
//! uploader at most once.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::record::RecordKey;

/// File selected by the user
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFile {
    pub file_name: CompactString,

    #[serde(default = "default_content_type")]
    pub content_type: CompactString,

    #[serde(default)]
    pub data: Bytes,
}

fn default_content_type() -> CompactString {
    CompactString::const_new("application/octet-stream")
}

impl AttachmentFile {
    pub fn new(
        file_name: impl Into<CompactString>,
        content_type: impl Into<CompactString>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for AttachmentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.data.len())
            .finish()
    }
}

/// A file waiting for its owner to be persisted
#[derive(Debug, Clone)]
pub struct DeferredAttachment {
    pub file: AttachmentFile,
    pub owner: RecordKey,
    pub queued_at: DateTime<Utc>,
    /// Failed upload attempts so far
    pub attempts: u32,
}

/// Per-owner batches of deferred attachments
#[derive(Default)]
pub struct AttachmentQueue {
    pending: Mutex<FxHashMap<RecordKey, Vec<DeferredAttachment>>>,
}

impl AttachmentQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage files under `owner`. A file with the same name replaces the
    /// earlier one. Returns the batch size afterwards.
    pub fn enqueue(&self, owner: &RecordKey, files: impl IntoIterator<Item = AttachmentFile>) -> usize {
        let now = Utc::now();
        let mut pending = self.pending.lock();
        let batch = pending.entry(owner.clone()).or_default();

        for file in files {
            batch.retain(|queued| queued.file.file_name != file.file_name);
            batch.push(DeferredAttachment {
                file,
                owner: owner.clone(),
                queued_at: now,
                attempts: 0,
            });
        }

        debug!(owner = %owner, queued = batch.len(), "Attachments staged");
        batch.len()
    }

    /// Unstage a file by name
    pub fn remove(&self, owner: &RecordKey, file_name: &str) -> bool {
        let mut pending = self.pending.lock();
        let Some(batch) = pending.get_mut(owner) else {
            return false;
        };

        let before = batch.len();
        batch.retain(|queued| queued.file.file_name != file_name);
        let removed = batch.len() != before;
        if batch.is_empty() {
            pending.remove(owner);
        }
        removed
    }

    /// Take the whole batch for `owner`, leaving nothing behind.
    #[must_use]
    pub fn drain(&self, owner: &RecordKey) -> Vec<DeferredAttachment> {
        self.pending.lock().remove(owner).unwrap_or_default()
    }

    /// Put a batch that failed to upload back under `owner`, ahead of
    /// anything staged since it was drained.
    pub fn requeue(&self, owner: &RecordKey, batch: Vec<DeferredAttachment>) {
        if batch.is_empty() {
            return;
        }

        let mut pending = self.pending.lock();
        let newer = pending.remove(owner).unwrap_or_default();

        let mut merged: Vec<DeferredAttachment> = batch
            .into_iter()
            .filter(|old| !newer.iter().any(|n| n.file.file_name == old.file.file_name))
            .map(|mut old| {
                old.owner = owner.clone();
                old.attempts += 1;
                old
            })
            .collect();
        merged.extend(newer);

        debug!(owner = %owner, queued = merged.len(), "Attachments re-queued");
        pending.insert(owner.clone(), merged);
    }

    /// Move everything staged under `from` to the back of `to`'s batch.
    /// A moved file replaces a same-named one already under `to`.
    pub fn transfer(&self, from: &RecordKey, to: &RecordKey) -> usize {
        let mut pending = self.pending.lock();
        let Some(moved) = pending.remove(from) else {
            return 0;
        };

        let count = moved.len();
        let batch = pending.entry(to.clone()).or_default();
        for mut item in moved {
            batch.retain(|queued| queued.file.file_name != item.file.file_name);
            item.owner = to.clone();
            batch.push(item);
        }

        debug!(from = %from, to = %to, moved = count, "Attachments moved to new owner");
        count
    }

    /// Drop the batch for `owner` without uploading. Returns how many were dropped.
    pub fn discard(&self, owner: &RecordKey) -> usize {
        self.pending.lock().remove(owner).map_or(0, |batch| batch.len())
    }

    #[must_use]
    pub fn len(&self, owner: &RecordKey) -> usize {
        self.pending.lock().get(owner).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self, owner: &RecordKey) -> bool {
        self.len(owner) == 0
    }

    /// File names staged under `owner`, in upload order
    #[must_use]
    pub fn file_names(&self, owner: &RecordKey) -> Vec<CompactString> {
        self.pending
            .lock()
            .get(owner)
            .map(|batch| batch.iter().map(|a| a.file.file_name.clone()).collect())
            .unwrap_or_default()
    }

    /// Total files staged across all owners
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}

impl fmt::Debug for AttachmentQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("AttachmentQueue")
            .field("owners", &pending.len())
            .field("files", &pending.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
