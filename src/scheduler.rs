//! Read scheduling.
//!
//! For a requested key, decides between serving the cached value, serving it
//! while revalidating in the background, or blocking on a fetch. The decision
//! is a pure function of the observed entry state and the read mode; the
//! engine executes it.

use std::time::Duration;

use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::entry::{CacheEntry, EntryStatus};

/// Behavior when a read lands on a stale entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Serve the stale value immediately and refetch in the background.
    #[default]
    StaleWhileRevalidate,
    /// Block on the refetch even when a stale value could be served. For
    /// correctness-critical reads.
    BlockOnStale,
}

/// Per-query freshness and retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Duration a committed value is served without refetching.
    pub stale_window: Duration,
    /// Duration an unobserved entry is retained before becoming evictable.
    pub retention_window: Duration,
    pub mode: ReadMode,
}

impl QueryPolicy {
    /// Policy using the engine's configured default windows.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            stale_window: config.stale_window(),
            retention_window: config.retention_window(),
            mode: ReadMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What the engine should do for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDisposition {
    /// Entry is fresh: serve it synchronously, no fetch.
    ServeFresh,
    /// Entry is stale: serve the cached value now, refetch in the background.
    ServeStaleRevalidate,
    /// No servable value (absent, invalidated, or empty): block until a
    /// deduplicated fetch settles.
    BlockAndFetch,
}

/// Decide the read path for an observed entry.
///
/// `entry` is the servable view: callers pass `None` for absent, invalidated,
/// and empty entries. A fresh entry past its `stale_at` deadline counts as
/// stale even before any cascade touches it.
pub fn disposition(
    entry: Option<&CacheEntry>,
    mode: ReadMode,
    now: OffsetDateTime,
) -> ReadDisposition {
    match entry {
        None => ReadDisposition::BlockAndFetch,
        Some(entry) => {
            if entry.is_fresh(now) {
                ReadDisposition::ServeFresh
            } else if entry.has_value() {
                match mode {
                    ReadMode::StaleWhileRevalidate => ReadDisposition::ServeStaleRevalidate,
                    ReadMode::BlockOnStale => ReadDisposition::BlockAndFetch,
                }
            } else {
                ReadDisposition::BlockAndFetch
            }
        }
    }
}
