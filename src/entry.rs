//! Cache entry model.

use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;

use crate::events::Epoch;

/// Lifecycle status of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Within the stale window; servable without a fetch.
    Fresh,
    /// Past the stale window or touched by a mark-stale cascade; servable
    /// while a background refetch runs.
    Stale,
    /// Cleared by an invalidation cascade; the next read must block on a
    /// full fetch.
    Invalidated,
    /// Known key with no value yet (first fetch pending or failed).
    Empty,
}

/// Pre-optimistic state retained for rollback.
#[derive(Debug, Clone)]
pub(crate) struct Shadow {
    pub value: Option<Value>,
    pub status: EntryStatus,
    pub revision: u64,
}

/// One cached read result, owned exclusively by the store.
///
/// Invariant: `stale_at >= fetched_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Last committed value. `None` for `Invalidated`/`Empty` entries.
    pub value: Option<Value>,
    pub status: EntryStatus,
    /// When the value was fetched.
    pub fetched_at: OffsetDateTime,
    /// When the value stops being fresh.
    pub stale_at: OffsetDateTime,
    /// When the entry becomes evictable if unobserved. Slides on access.
    pub gc_at: OffsetDateTime,
    /// Retention window used to slide `gc_at` on access.
    pub retention: Duration,
    /// Bumped on every value or status commit; drives exactly-once fan-out.
    pub revision: u64,
    /// Epoch of the latest mutation cascade that touched this entry. A fetch
    /// that started before this epoch must not overwrite the entry.
    pub invalidated_epoch: Epoch,
    pub(crate) shadow: Option<Shadow>,
}

impl CacheEntry {
    /// True if the entry holds a servable value (fresh or stale).
    pub fn has_value(&self) -> bool {
        self.value.is_some()
            && matches!(self.status, EntryStatus::Fresh | EntryStatus::Stale)
    }

    /// True if the entry is fresh at `now`.
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.status == EntryStatus::Fresh && now < self.stale_at
    }

    /// True if an optimistic value is currently applied.
    pub fn has_optimistic(&self) -> bool {
        self.shadow.is_some()
    }
}
