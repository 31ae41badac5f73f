//! The queue item as the journal sees it.

use bytes::Bytes;

/// A single queued item.
///
/// The journal serializes `add_time`, `expiry`, and `data`; the transaction
/// id (`xid`) exists only in memory and is never written inside an item
/// block. It is assigned by the owning queue when the item is tentatively
/// removed and reused for the matching confirm or unremove record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Absolute enqueue time, milliseconds since the Unix epoch.
    pub add_time: u64,

    /// Absolute expiry time, milliseconds since the Unix epoch.
    /// `0` means the item never expires.
    pub expiry: u64,

    /// Opaque payload bytes.
    pub data: Bytes,

    /// Transaction id of an in-flight tentative remove. In-memory only.
    pub xid: u32,
}

impl QueueItem {
    /// Create an item with no in-flight transaction.
    #[must_use]
    pub fn new(add_time: u64, expiry: u64, data: impl Into<Bytes>) -> Self {
        Self {
            add_time,
            expiry,
            data: data.into(),
            xid: 0,
        }
    }

    /// Whether the item has expired as of `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry != 0 && self.expiry <= now_ms
    }
}
