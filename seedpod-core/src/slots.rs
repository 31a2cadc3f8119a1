//! Global concurrency budget: one counting semaphore for downloads, one for uploads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default number of concurrent segment downloads.
pub const DEFAULT_DOWNLOAD_SLOTS: usize = 5;

/// Default number of concurrent segment uploads.
pub const DEFAULT_UPLOAD_SLOTS: usize = 5;

/// A counting semaphore with a fixed limit.
///
/// `try_acquire` increments first and rolls back when the limit is exceeded, so `count` may
/// briefly exceed `limit` inside that call but `used()` never reports it.
#[derive(Debug)]
pub struct SlotItem {
    limit: usize,
    count: AtomicUsize,
}

impl SlotItem {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            count: AtomicUsize::new(0),
        })
    }

    /// Take one slot if any is free. The slot is returned when the permit drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotPermit> {
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        if previous >= self.limit {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(SlotPermit { item: self.clone() })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.limit)
    }

    pub fn has_free(&self) -> bool {
        self.count.load(Ordering::Acquire) < self.limit
    }
}

/// One held slot; releases on drop.
#[derive(Debug)]
pub struct SlotPermit {
    item: Arc<SlotItem>,
}

impl SlotPermit {
    pub fn item(&self) -> &SlotItem {
        &self.item
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.item.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Read-only view of slot usage, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub download_used: usize,
    pub download_limit: usize,
    pub upload_used: usize,
    pub upload_limit: usize,
}

/// The download and upload budgets.
#[derive(Debug, Clone)]
pub struct ConcurrencySlots {
    pub download: Arc<SlotItem>,
    pub upload: Arc<SlotItem>,
}

impl ConcurrencySlots {
    pub fn new(download_limit: usize, upload_limit: usize) -> Self {
        Self {
            download: SlotItem::new(download_limit),
            upload: SlotItem::new(upload_limit),
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            download_used: self.download.used(),
            download_limit: self.download.limit(),
            upload_used: self.upload.used(),
            upload_limit: self.upload.limit(),
        }
    }
}

impl Default for ConcurrencySlots {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNLOAD_SLOTS, DEFAULT_UPLOAD_SLOTS)
    }
}
