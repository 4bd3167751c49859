//! Engine facade.
//!
//! One `QueryEngine` is one logical cache instance: it owns the store, the
//! in-flight registry, the subscriber hub, and the event log, and exposes the
//! two external contracts — read registration (`subscribe`/`fetch`) and
//! mutation registration (`mutation`). Engines are constructed explicitly and
//! passed by reference; there is no process-global instance, so tests run any
//! number of isolated engines side by side.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::entry::{CacheEntry, EntryStatus};
use crate::error::{FetchError, KeyError, QueryError};
use crate::events::{EventKind, EventLog};
use crate::inflight::{FetchFuture, FetchTicket, InFlightRegistry};
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::{rw_read, rw_write};
use crate::mutation::{
    Invalidation, InvalidationScope, MutationDescriptor, MutationHandle, OptimisticUpdate,
    cascade_status, cascade_update,
};
use crate::scheduler::{QueryPolicy, ReadDisposition, disposition};
use crate::store::CacheStore;
use crate::subscribers::{QueryUpdate, SubscriberHub, SubscriptionId};

const SOURCE: &str = "requery::engine";
const METRIC_FETCH_DISCARDED_TOTAL: &str = "requery_fetch_discarded_total";
const METRIC_SWEEP_MS: &str = "requery_sweep_ms";

/// A blocked read retries when its settle is superseded by a mutation; the
/// bound keeps a pathological mutation storm from starving the reader.
const MAX_SETTLE_ATTEMPTS: usize = 4;

/// An opaque asynchronous read supplied by a collaborator.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredFetcher {
    fetch: FetchFn,
    policy: QueryPolicy,
}

/// Point-in-time view of a query returned from the read contract.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub key: QueryKey,
    pub status: EntryStatus,
    pub value: Option<Value>,
    pub error: Option<FetchError>,
    pub revision: u64,
}

fn snapshot_of(canonical: &CanonicalKey, entry: &CacheEntry) -> QuerySnapshot {
    QuerySnapshot {
        key: canonical.query_key().clone(),
        status: entry.status,
        value: entry.value.clone(),
        error: None,
        revision: entry.revision,
    }
}

enum SettleOutcome {
    Committed(QuerySnapshot),
    /// The settle was superseded by a newer mutation and intentionally
    /// dropped; observable as `EventKind::FetchDiscarded`.
    Discarded,
}

/// An active observation of one key.
///
/// Holds the initial snapshot plus a channel of subsequent updates. Dropping
/// the subscription (or calling [`Subscription::unsubscribe`]) removes the
/// observer; other observers of the same key are unaffected, and an in-flight
/// fetch keeps running for them.
pub struct Subscription {
    id: SubscriptionId,
    canonical: CanonicalKey,
    snapshot: QuerySnapshot,
    /// Updates that arrived while the subscription was being set up and were
    /// not covered by the snapshot.
    pending: VecDeque<QueryUpdate>,
    receiver: mpsc::UnboundedReceiver<QueryUpdate>,
    engine: Weak<QueryEngine>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        self.canonical.query_key()
    }

    /// The value/status/error observed at subscription time.
    pub fn snapshot(&self) -> &QuerySnapshot {
        &self.snapshot
    }

    /// Await the next committed change (or error) for this key.
    pub async fn next_update(&mut self) -> Option<QueryUpdate> {
        if let Some(update) = self.pending.pop_front() {
            return Some(update);
        }
        self.receiver.recv().await
    }

    /// Non-blocking poll for a pending update.
    pub fn try_update(&mut self) -> Option<QueryUpdate> {
        if let Some(update) = self.pending.pop_front() {
            return Some(update);
        }
        self.receiver.try_recv().ok()
    }

    /// Stop observing. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.release(self.id, &self.canonical);
        }
    }
}

/// The query cache and mutation-coordination engine.
pub struct QueryEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: CacheStore,
    inflight: Arc<InFlightRegistry>,
    hub: SubscriberHub,
    events: EventLog,
    fetchers: RwLock<HashMap<CanonicalKey, RegisteredFetcher>>,
}

impl QueryEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Engine with an injected time source; used with
    /// [`crate::clock::ManualClock`] to drive staleness and eviction in tests.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            events: EventLog::new(config.event_log_limit),
            config,
            clock,
            store: CacheStore::new(),
            inflight: InFlightRegistry::new(),
            hub: SubscriberHub::new(),
            fetchers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The engine's observable event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Policy using the engine's configured default windows.
    pub fn default_policy(&self) -> QueryPolicy {
        QueryPolicy::from_config(&self.config)
    }

    /// Raw view of a cached entry regardless of status. Diagnostic; does not
    /// slide the retention deadline.
    pub fn peek(&self, key: &QueryKey) -> Result<Option<CacheEntry>, KeyError> {
        Ok(self.store.entry(&key.canonical()?))
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> Result<usize, KeyError> {
        Ok(self.hub.subscriber_count(&key.canonical()?))
    }

    fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    // ========================================================================
    // Read contract
    // ========================================================================

    /// One-shot read: serve cached, serve-and-revalidate, or block on a
    /// deduplicated fetch, per the entry state and the policy's mode.
    pub async fn fetch(
        self: &Arc<Self>,
        key: &QueryKey,
        fetch: FetchFn,
        policy: QueryPolicy,
    ) -> Result<QuerySnapshot, QueryError> {
        let canonical = key.canonical()?;
        self.read_path(&canonical, &fetch, &policy)
            .await
            .map_err(QueryError::from)
    }

    /// Observe a key: returns the current snapshot plus a channel of
    /// subsequent updates, and retains `fetch` so mutations can refetch the
    /// key while it has subscribers.
    ///
    /// A failed first fetch still yields a live subscription; the failure is
    /// carried in the snapshot and nothing is cached.
    pub async fn subscribe(
        self: &Arc<Self>,
        key: &QueryKey,
        fetch: FetchFn,
        policy: QueryPolicy,
    ) -> Result<Subscription, QueryError> {
        let canonical = key.canonical()?;

        rw_write(&self.fetchers, SOURCE, "subscribe.fetchers").insert(
            canonical.clone(),
            RegisteredFetcher {
                fetch: fetch.clone(),
                policy,
            },
        );

        // Register the observer before the read so a commit landing between
        // the fetch and the registration cannot be missed; revision gating
        // suppresses re-delivery of state the snapshot already reflects.
        let seen_revision = self.store.entry(&canonical).map_or(0, |e| e.revision);
        let (id, mut receiver) = self.hub.subscribe(&canonical, seen_revision);

        let snapshot = match self.read_path(&canonical, &fetch, &policy).await {
            Ok(snapshot) => snapshot,
            Err(error) => QuerySnapshot {
                key: canonical.query_key().clone(),
                status: EntryStatus::Empty,
                value: None,
                error: Some(error),
                revision: 0,
            },
        };

        // The read above may have committed and fanned out to this observer,
        // which was already registered; drop queued updates the snapshot
        // already reflects so every distinct change is delivered once.
        let mut pending = VecDeque::new();
        while let Ok(update) = receiver.try_recv() {
            let duplicate_commit = update.revision != 0 && update.revision <= snapshot.revision;
            let duplicate_error = update.revision == 0 && snapshot.error.is_some();
            if !duplicate_commit && !duplicate_error {
                pending.push_back(update);
            }
        }

        Ok(Subscription {
            id,
            canonical,
            snapshot,
            pending,
            receiver,
            engine: Arc::downgrade(self),
        })
    }

    async fn read_path(
        self: &Arc<Self>,
        canonical: &CanonicalKey,
        fetch: &FetchFn,
        policy: &QueryPolicy,
    ) -> Result<QuerySnapshot, FetchError> {
        let now = self.now();
        let entry = self.store.get(canonical, now);

        if let Some(entry) = &entry {
            match disposition(Some(entry), policy.mode, now) {
                ReadDisposition::ServeFresh => return Ok(snapshot_of(canonical, entry)),
                ReadDisposition::ServeStaleRevalidate => {
                    self.spawn_revalidate(canonical.clone(), fetch.clone(), *policy);
                    return Ok(snapshot_of(canonical, entry));
                }
                ReadDisposition::BlockAndFetch => {}
            }
        }

        self.block_fetch(canonical, fetch, policy).await
    }

    async fn block_fetch(
        self: &Arc<Self>,
        canonical: &CanonicalKey,
        fetch: &FetchFn,
        policy: &QueryPolicy,
    ) -> Result<QuerySnapshot, FetchError> {
        for _ in 0..MAX_SETTLE_ATTEMPTS {
            match self.fetch_once(canonical, fetch, policy).await? {
                SettleOutcome::Committed(snapshot) => return Ok(snapshot),
                SettleOutcome::Discarded => {
                    // A newer mutation superseded this fetch; serve whatever
                    // its replacement committed, or try again.
                    if let Some(entry) = self.store.get(canonical, self.now()) {
                        return Ok(snapshot_of(canonical, &entry));
                    }
                }
            }
        }
        Err(FetchError::new(
            "fetch repeatedly superseded by concurrent mutations",
        ))
    }

    async fn fetch_once(
        self: &Arc<Self>,
        canonical: &CanonicalKey,
        fetch: &FetchFn,
        policy: &QueryPolicy,
    ) -> Result<SettleOutcome, FetchError> {
        let started_epoch = self.events.next_epoch();
        let fetch_fn = fetch.clone();
        let ticket = self
            .inflight
            .get_or_start(canonical, started_epoch, move || fetch_fn());

        if ticket.started {
            self.events.publish_at(
                started_epoch,
                EventKind::FetchStarted {
                    key: canonical.to_string(),
                },
            );
        } else {
            self.events.publish(EventKind::FetchDeduplicated {
                key: canonical.to_string(),
            });
        }

        let shared = ticket.shared.clone();
        match shared.await {
            Ok(value) => Ok(self.commit_settle(canonical, &ticket, value, policy)),
            Err(error) => {
                self.handle_fetch_failure(canonical, &error);
                Err(error)
            }
        }
    }

    /// Apply a settled fetch to the store, unless a mutation superseded it.
    ///
    /// Every waiter of a shared fetch resumes through here; the ticket's
    /// commit latch makes sure the settle is applied (and fanned out) once,
    /// with the other waiters reading the committed entry back.
    fn commit_settle(
        &self,
        canonical: &CanonicalKey,
        ticket: &FetchTicket,
        value: Value,
        policy: &QueryPolicy,
    ) -> SettleOutcome {
        let first = ticket.claim_commit();
        let superseded_epoch = self
            .store
            .entry(canonical)
            .map_or(0, |entry| entry.invalidated_epoch);
        if ticket.is_superseded() || superseded_epoch > ticket.started_epoch {
            if first {
                self.events.publish(EventKind::FetchDiscarded {
                    key: canonical.to_string(),
                    started_epoch: ticket.started_epoch,
                    superseded_epoch,
                });
                counter!(METRIC_FETCH_DISCARDED_TOTAL).increment(1);
                debug!(key = %canonical, "Discarded superseded fetch settle");
            }
            return SettleOutcome::Discarded;
        }

        if !first {
            let snapshot = match self.store.entry(canonical) {
                Some(entry) => snapshot_of(canonical, &entry),
                // The committing waiter claimed the latch but has not stored
                // the entry yet; the settled value stands in for it.
                None => QuerySnapshot {
                    key: canonical.query_key().clone(),
                    status: EntryStatus::Fresh,
                    value: Some(value),
                    error: None,
                    revision: 0,
                },
            };
            return SettleOutcome::Committed(snapshot);
        }

        let revision = self.store.set(
            canonical,
            value.clone(),
            policy.stale_window,
            policy.retention_window,
            self.now(),
        );
        self.events.publish(EventKind::EntryCommitted {
            key: canonical.to_string(),
        });
        // Fan-out strictly after the store commit.
        self.hub.notify(
            canonical,
            &QueryUpdate {
                status: EntryStatus::Fresh,
                value: Some(value.clone()),
                error: None,
                revision,
            },
        );

        SettleOutcome::Committed(QuerySnapshot {
            key: canonical.query_key().clone(),
            status: EntryStatus::Fresh,
            value: Some(value),
            error: None,
            revision,
        })
    }

    /// A failed fetch never touches previously cached data; subscribers get
    /// the error alongside the entry's current status.
    fn handle_fetch_failure(&self, canonical: &CanonicalKey, error: &FetchError) {
        self.events.publish(EventKind::FetchFailed {
            key: canonical.to_string(),
        });
        let status = self
            .store
            .entry(canonical)
            .map_or(EntryStatus::Empty, |entry| entry.status);
        self.hub.notify_error(canonical, status, error.clone());
    }

    fn spawn_revalidate(self: &Arc<Self>, canonical: CanonicalKey, fetch: FetchFn, policy: QueryPolicy) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = engine
                .fetch_once(&canonical, &fetch, &policy)
                .await
                .map(|_| ())
            {
                debug!(
                    key = %canonical,
                    error = %error,
                    "Background revalidation failed; stale value retained"
                );
            }
        });
    }

    // ========================================================================
    // Mutation contract
    // ========================================================================

    /// Bind a mutation descriptor to this engine.
    pub fn mutation(self: &Arc<Self>, descriptor: MutationDescriptor) -> MutationHandle {
        MutationHandle::new(Arc::clone(self), descriptor)
    }

    /// Execute a mutation's invalidation cascade: transition every entry
    /// under the declared prefixes, supersede in-flight fetches for those
    /// keys, notify subscribers of the transitions, then refetch each
    /// affected key with active subscribers. Keys without subscribers stay
    /// lazily stale until their next access.
    #[instrument(skip_all, fields(prefixes = invalidations.len()))]
    pub(crate) async fn run_cascade(self: &Arc<Self>, invalidations: &[Invalidation]) {
        if invalidations.is_empty() {
            return;
        }
        let epoch = self.events.next_epoch();

        // Phase 1: status transitions and cancellation, before any refetch.
        for invalidation in invalidations {
            let hits = match invalidation.scope {
                InvalidationScope::MarkStale => self.store.mark_stale(&invalidation.prefix, epoch),
                InvalidationScope::Evict => self.store.invalidate(&invalidation.prefix, epoch),
            };
            self.inflight.cancel_matching(&invalidation.prefix);

            let affected = hits.len();
            self.events.publish(match invalidation.scope {
                InvalidationScope::MarkStale => EventKind::MarkedStale {
                    prefix: invalidation.prefix.to_string(),
                    affected,
                },
                InvalidationScope::Evict => EventKind::Invalidated {
                    prefix: invalidation.prefix.to_string(),
                    affected,
                },
            });

            let status = cascade_status(invalidation.scope);
            for hit in hits.into_iter().filter(|hit| hit.transitioned) {
                let value = match invalidation.scope {
                    InvalidationScope::MarkStale => {
                        self.store.entry(&hit.key).and_then(|entry| entry.value)
                    }
                    InvalidationScope::Evict => None,
                };
                self.hub
                    .notify(&hit.key, &cascade_update(status, value, hit.revision));
            }
        }

        // Phase 2: eager refetch, subscribed keys only.
        let mut targets: Vec<CanonicalKey> = Vec::new();
        for invalidation in invalidations {
            for key in self.hub.subscribed_under(&invalidation.prefix) {
                if !targets.contains(&key) {
                    targets.push(key);
                }
            }
        }
        for key in &targets {
            self.refetch(key).await;
        }
    }

    async fn refetch(self: &Arc<Self>, canonical: &CanonicalKey) {
        let fetcher = rw_read(&self.fetchers, SOURCE, "refetch")
            .get(canonical)
            .cloned();
        let Some(fetcher) = fetcher else {
            debug!(key = %canonical, "No registered fetcher; key stays stale until next access");
            return;
        };
        match self
            .fetch_once(canonical, &fetcher.fetch, &fetcher.policy)
            .await
        {
            Ok(_) => {}
            Err(error) => {
                debug!(key = %canonical, error = %error, "Refetch failed; stale value retained");
            }
        }
    }

    pub(crate) fn apply_optimistic(&self, updates: &[OptimisticUpdate]) -> Vec<CanonicalKey> {
        let now = self.now();
        let mut applied = Vec::new();
        for update in updates {
            let canonical = match update.key.canonical() {
                Ok(canonical) => canonical,
                Err(error) => {
                    warn!(key = %update.key, error = %error, "Skipping optimistic update for invalid key");
                    continue;
                }
            };
            let revision = self.store.apply_optimistic(
                &canonical,
                update.value.clone(),
                now,
                self.config.retention_window(),
            );
            self.events.publish(EventKind::OptimisticApplied {
                key: canonical.to_string(),
            });
            self.hub.notify(
                &canonical,
                &QueryUpdate {
                    status: EntryStatus::Stale,
                    value: Some(update.value.clone()),
                    error: None,
                    revision,
                },
            );
            applied.push(canonical);
        }
        applied
    }

    pub(crate) fn rollback_optimistic(&self, applied: &[CanonicalKey]) {
        for canonical in applied {
            let Some(revision) = self.store.rollback_optimistic(canonical) else {
                continue;
            };
            self.events.publish(EventKind::OptimisticRolledBack {
                key: canonical.to_string(),
            });
            let (status, value) = self
                .store
                .entry(canonical)
                .map_or((EntryStatus::Empty, None), |entry| {
                    (entry.status, entry.value)
                });
            self.hub.notify(
                canonical,
                &QueryUpdate {
                    status,
                    value,
                    error: None,
                    revision,
                },
            );
        }
    }

    pub(crate) fn commit_optimistic(&self, applied: &[CanonicalKey]) {
        for canonical in applied {
            self.store.commit_optimistic(canonical);
        }
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Remove unobserved entries past their retention deadline. Returns the
    /// eviction count.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> usize {
        let started_at = Instant::now();
        let subscribed = self.hub.subscribed_keys();
        let evicted = self.store.evict_expired(self.now(), &subscribed);
        for key in &evicted {
            self.events.publish(EventKind::Evicted {
                key: key.to_string(),
            });
        }
        histogram!(METRIC_SWEEP_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Eviction sweep complete");
        }
        evicted.len()
    }

    /// Run [`QueryEngine::sweep`] on the configured interval until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh engine is not
            // swept before it has served anything.
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.sweep();
            }
        })
    }

    fn release(&self, id: SubscriptionId, canonical: &CanonicalKey) {
        self.hub.unsubscribe(id);
        if self.hub.subscriber_count(canonical) == 0 {
            rw_write(&self.fetchers, SOURCE, "release.fetchers").remove(canonical);
        }
    }
}
