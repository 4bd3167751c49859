//! Engine event log.
//!
//! Every state transition the engine performs is published as an event with
//! a monotonically increasing epoch. The epoch counter is also the ordering
//! clock the engine uses to decide whether a fetch settle has been superseded
//! by a later mutation: a settle whose fetch started before an entry's last
//! invalidation epoch is discarded, observable here as `FetchDiscarded`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::lock::mutex_lock;

const SOURCE: &str = "requery::events";

/// Monotonic epoch for ordering commits and invalidations.
pub type Epoch = u64;

/// A recorded engine state transition.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this engine instance.
    pub epoch: Epoch,
    /// The kind of transition.
    pub kind: EventKind,
    /// When the event was recorded.
    pub timestamp: OffsetDateTime,
}

/// Kinds of engine state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A fetch result was committed to the store.
    EntryCommitted { key: String },
    /// Entries under a prefix were marked stale by a mutation.
    MarkedStale { prefix: String, affected: usize },
    /// Entries under a prefix were invalidated (value cleared) by a mutation.
    Invalidated { prefix: String, affected: usize },
    /// A new fetch started for a key.
    FetchStarted { key: String },
    /// A concurrent request joined an existing in-flight fetch.
    FetchDeduplicated { key: String },
    /// A fetch settled after being superseded by a newer mutation; its result
    /// was intentionally dropped and never applied to the store. Not surfaced
    /// to callers.
    FetchDiscarded {
        key: String,
        started_epoch: Epoch,
        superseded_epoch: Epoch,
    },
    /// A fetch failed; any previously cached value was kept.
    FetchFailed { key: String },
    /// A mutation run settled.
    MutationSettled { name: String, success: bool },
    /// An optimistic value was applied ahead of a mutation's settle.
    OptimisticApplied { key: String },
    /// An optimistic value was rolled back after a mutation failure.
    OptimisticRolledBack { key: String },
    /// An unobserved entry past its retention deadline was removed.
    Evicted { key: String },
}

/// Bounded in-memory event log.
///
/// Writers publish, tests and diagnostics drain. The epoch counter is shared
/// with the engine as its single ordering clock.
pub struct EventLog {
    events: Mutex<VecDeque<EngineEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    /// Allocate the next epoch without recording an event.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Record an event at a freshly allocated epoch. Returns the epoch.
    pub fn publish(&self, kind: EventKind) -> Epoch {
        let epoch = self.next_epoch();
        self.publish_at(epoch, kind);
        epoch
    }

    /// Record an event at an epoch allocated earlier by the caller.
    pub fn publish_at(&self, epoch: Epoch, kind: EventKind) {
        let event = EngineEvent {
            id: Uuid::new_v4(),
            epoch,
            kind: kind.clone(),
            timestamp: OffsetDateTime::now_utc(),
        };

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?kind,
            "Engine event recorded"
        );

        let mut events = mutex_lock(&self.events, SOURCE, "publish_at");
        if events.len() == self.limit {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Drain all recorded events in epoch order.
    pub fn drain(&self) -> Vec<EngineEvent> {
        mutex_lock(&self.events, SOURCE, "drain").drain(..).collect()
    }

    /// Snapshot the recorded events without draining.
    pub fn snapshot(&self) -> Vec<EngineEvent> {
        mutex_lock(&self.events, SOURCE, "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.events, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_monotonicity() {
        let log = EventLog::new(100);

        let e1 = log.next_epoch();
        let e2 = log.next_epoch();
        let e3 = log.publish(EventKind::FetchStarted { key: "k".into() });

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn publish_and_drain_in_order() {
        let log = EventLog::new(100);

        log.publish(EventKind::FetchStarted { key: "a".into() });
        log.publish(EventKind::EntryCommitted { key: "a".into() });

        let events = log.drain();
        assert_eq!(events.len(), 2);
        assert!(events[0].epoch < events[1].epoch);
        assert!(matches!(events[0].kind, EventKind::FetchStarted { .. }));
        assert!(log.is_empty());
    }

    #[test]
    fn log_is_bounded() {
        let log = EventLog::new(2);

        log.publish(EventKind::FetchStarted { key: "a".into() });
        log.publish(EventKind::FetchStarted { key: "b".into() });
        log.publish(EventKind::FetchStarted { key: "c".into() });

        let events = log.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].kind,
            EventKind::FetchStarted { key: "b".into() }
        );
    }

    #[test]
    fn snapshot_does_not_drain() {
        let log = EventLog::new(10);
        log.publish(EventKind::Evicted { key: "a".into() });

        assert_eq!(log.snapshot().len(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn publish_at_preserves_caller_epoch() {
        let log = EventLog::new(10);
        let epoch = log.next_epoch();

        // A later allocation happens before the earlier epoch is recorded.
        let _ = log.next_epoch();
        log.publish_at(
            epoch,
            EventKind::FetchDiscarded {
                key: "k".into(),
                started_epoch: epoch,
                superseded_epoch: epoch + 1,
            },
        );

        let events = log.drain();
        assert_eq!(events[0].epoch, epoch);
    }
}
