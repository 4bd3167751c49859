//! Mutation coordination.
//!
//! A mutation executes an opaque write and, on success only, walks its
//! declared invalidation prefixes: affected entries are marked stale (or
//! invalidated outright), in-flight fetches for those keys are superseded,
//! and every affected key with an active subscriber is refetched before
//! `run` returns. A failed write applies no invalidation at all, and rolls
//! back any optimistic values to their shadowed pre-mutation state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::histogram;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::engine::QueryEngine;
use crate::entry::EntryStatus;
use crate::error::MutationError;
use crate::events::EventKind;
use crate::key::QueryKey;
use crate::subscribers::QueryUpdate;

const METRIC_MUTATION_RUN_MS: &str = "requery_mutation_run_ms";

/// A boxed write supplied by a collaborator.
pub type MutationFuture = BoxFuture<'static, Result<Value, MutationError>>;

type RunFn = dyn Fn(Value) -> MutationFuture + Send + Sync;
type InvalidatesFn = dyn Fn(&Value, &Value) -> Vec<Invalidation> + Send + Sync;
type OptimisticFn = dyn Fn(&Value) -> Vec<OptimisticUpdate> + Send + Sync;

/// How a prefix cascade treats affected entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationScope {
    /// Mark descendants stale; their values remain servable while refetching.
    #[default]
    MarkStale,
    /// Clear descendant values entirely; the next read blocks on a full
    /// fetch. For writes where stale-serve cannot be trusted, e.g. list
    /// inserts at unknown positions.
    Evict,
}

/// One declared invalidation target.
#[derive(Debug, Clone)]
pub struct Invalidation {
    pub prefix: QueryKey,
    pub scope: InvalidationScope,
}

impl Invalidation {
    pub fn mark_stale(prefix: QueryKey) -> Self {
        Self {
            prefix,
            scope: InvalidationScope::MarkStale,
        }
    }

    pub fn evict(prefix: QueryKey) -> Self {
        Self {
            prefix,
            scope: InvalidationScope::Evict,
        }
    }
}

/// A provisional value applied to one exact key ahead of the write's settle.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    pub key: QueryKey,
    pub value: Value,
}

/// Behavior when `run` is called while a previous run is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Run concurrently. The default: writes are not idempotent, so the
    /// engine never deduplicates them.
    #[default]
    Allow,
    /// Reject the new run with [`MutationError::AlreadyRunning`].
    Reject,
    /// Queue runs behind one another.
    Serialize,
}

/// Coordinator state visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Running,
}

/// Declares a write: its name, execution function, invalidation map, and
/// optional optimistic updates. Immutable after construction.
pub struct MutationDescriptor {
    name: String,
    run: Box<RunFn>,
    invalidates: Box<InvalidatesFn>,
    optimistic: Option<Box<OptimisticFn>>,
    concurrency: ConcurrencyPolicy,
}

impl MutationDescriptor {
    /// Descriptor with no invalidations; chain builders to declare them.
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(Value) -> MutationFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
            invalidates: Box::new(|_, _| Vec::new()),
            optimistic: None,
            concurrency: ConcurrencyPolicy::default(),
        }
    }

    /// Declare the prefixes this write invalidates, derived from the input
    /// and the write's result (e.g. a created comment's post id).
    pub fn invalidates(
        mut self,
        f: impl Fn(&Value, &Value) -> Vec<Invalidation> + Send + Sync + 'static,
    ) -> Self {
        self.invalidates = Box::new(f);
        self
    }

    /// Declare provisional values applied before the write settles.
    pub fn optimistic(
        mut self,
        f: impl Fn(&Value) -> Vec<OptimisticUpdate> + Send + Sync + 'static,
    ) -> Self {
        self.optimistic = Some(Box::new(f));
        self
    }

    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A runnable mutation bound to an engine.
///
/// Obtained from [`QueryEngine::mutation`]; cheap to clone the `Arc` around.
pub struct MutationHandle {
    engine: Arc<QueryEngine>,
    descriptor: MutationDescriptor,
    running: AtomicUsize,
    serialize_gate: AsyncMutex<()>,
}

impl MutationHandle {
    pub(crate) fn new(engine: Arc<QueryEngine>, descriptor: MutationDescriptor) -> Self {
        Self {
            engine,
            descriptor,
            running: AtomicUsize::new(0),
            serialize_gate: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> MutationState {
        if self.running.load(Ordering::SeqCst) > 0 {
            MutationState::Running
        } else {
            MutationState::Idle
        }
    }

    /// Execute the write and, on success, the invalidation cascade.
    ///
    /// Returns the write's result. Invalidation is all-or-nothing: it happens
    /// only after the write's success is confirmed, and a failed write rolls
    /// any optimistic values back before returning.
    #[instrument(skip(self, input), fields(mutation = %self.descriptor.name))]
    pub async fn run(&self, input: Value) -> Result<Value, MutationError> {
        match self.descriptor.concurrency {
            ConcurrencyPolicy::Allow => {
                self.running.fetch_add(1, Ordering::SeqCst);
                let result = self.run_inner(input).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                result
            }
            ConcurrencyPolicy::Reject => {
                if self
                    .running
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(MutationError::AlreadyRunning {
                        name: self.descriptor.name.as_str().into(),
                    });
                }
                let result = self.run_inner(input).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                result
            }
            ConcurrencyPolicy::Serialize => {
                let _gate = self.serialize_gate.lock().await;
                self.running.fetch_add(1, Ordering::SeqCst);
                let result = self.run_inner(input).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }

    async fn run_inner(&self, input: Value) -> Result<Value, MutationError> {
        let started_at = Instant::now();

        let optimistic = self
            .descriptor
            .optimistic
            .as_ref()
            .map(|f| f(&input))
            .unwrap_or_default();
        let applied = self.engine.apply_optimistic(&optimistic);

        let result = (self.descriptor.run)(input.clone()).await;

        let success = result.is_ok();
        match &result {
            Ok(output) => {
                self.engine.commit_optimistic(&applied);
                let invalidations = (self.descriptor.invalidates)(&input, output);
                self.engine.run_cascade(&invalidations).await;
                info!(
                    mutation = %self.descriptor.name,
                    prefixes = invalidations.len(),
                    "Mutation committed"
                );
            }
            Err(error) => {
                self.engine.rollback_optimistic(&applied);
                warn!(
                    mutation = %self.descriptor.name,
                    error = %error,
                    rolled_back = applied.len(),
                    "Mutation failed; no invalidation applied"
                );
            }
        }

        self.engine.events().publish(EventKind::MutationSettled {
            name: self.descriptor.name.clone(),
            success,
        });
        histogram!(
            METRIC_MUTATION_RUN_MS,
            "mutation" => self.descriptor.name.clone(),
            "outcome" => if success { "success" } else { "failure" }
        )
        .record(started_at.elapsed().as_secs_f64() * 1000.0);

        result
    }
}

/// Status carried by cascade notifications, mapped from the scope.
pub(crate) fn cascade_status(scope: InvalidationScope) -> EntryStatus {
    match scope {
        InvalidationScope::MarkStale => EntryStatus::Stale,
        InvalidationScope::Evict => EntryStatus::Invalidated,
    }
}

pub(crate) fn cascade_update(
    status: EntryStatus,
    value: Option<Value>,
    revision: u64,
) -> QueryUpdate {
    QueryUpdate {
        status,
        value,
        error: None,
        revision,
    }
}
