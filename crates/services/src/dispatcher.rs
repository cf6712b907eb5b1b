//! # Update Dispatcher
//!
//! Applies an [`UpdateRequest`] to one aggregate as a single
//! read-modify-write. Two guards stack:
//!
//! - a per-identifier async mutex serialises callers inside this process;
//! - the durable store's compare-and-swap catches writers in other
//!   processes, in which case the cycle is replayed from a fresh read.
//!
//! Updates run against a private copy, so a rejected update or a failed
//! write never leaves a partial aggregate behind, in the store or the cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use domains::{Applied, DomainError, Identifier, Mutable, Result, UpdateRequest, Versioned};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::store::{narrow, AggregateStore};

const BACKOFF_BASE: Duration = Duration::from_millis(10);

type LockTable = DashMap<Identifier, Arc<Mutex<()>>>;

/// Per-identifier async mutexes. An entry lives only while someone holds
/// or waits on it.
#[derive(Default)]
pub(crate) struct KeyLocks {
    table: LockTable,
}

impl KeyLocks {
    pub(crate) async fn lock(&self, id: &Identifier) -> KeyLock<'_> {
        let slot = Arc::clone(&self.table.entry(id.clone()).or_default());
        let guard = slot.lock_owned().await;
        KeyLock { table: &self.table, id: id.clone(), guard: Some(guard) }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}

/// Held for the span of one critical section. The table entry is removed
/// once nobody else holds or waits on it.
pub(crate) struct KeyLock<'a> {
    table: &'a LockTable,
    id: Identifier,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        // Release before the cleanup check so a fresh mutex can never
        // coexist with a held one.
        self.guard.take();
        self.table.remove_if(&self.id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

pub struct UpdateDispatcher {
    store: Arc<AggregateStore>,
    locks: KeyLocks,
    cas_retries: u32,
}

impl UpdateDispatcher {
    pub fn new(store: Arc<AggregateStore>, cas_retries: u32) -> Self {
        Self { store, locks: KeyLocks::default(), cas_retries: cas_retries.max(1) }
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    /// Number of identifiers with a live critical section.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Creates a brand-new aggregate; a duplicate key is a `Conflict`.
    pub async fn create<M: Mutable>(&self, id: &Identifier, value: M) -> Result<Applied<M>> {
        let stored = self.store.create(id, value.into_aggregate()).await?;
        Ok(Applied { value: narrow(id, stored.value)?, changed: true, version: stored.version })
    }

    /// Applies `request` to an existing aggregate. Missing target is `NotFound`.
    #[instrument(level = "debug", skip_all, fields(id = %request.target, kind = M::KIND))]
    pub async fn apply<M: Mutable>(&self, request: &UpdateRequest<M>) -> Result<Applied<M>> {
        self.run(request, None::<fn() -> M>).await
    }

    /// Like [`apply`](Self::apply), but a missing target is first created
    /// from `init`. Used for index and relationship records that come into
    /// existence on first touch.
    #[instrument(level = "debug", skip_all, fields(id = %request.target, kind = M::KIND))]
    pub async fn upsert<M, F>(&self, request: &UpdateRequest<M>, init: F) -> Result<Applied<M>>
    where
        M: Mutable,
        F: Fn() -> M + Send + Sync,
    {
        self.run(request, Some(init)).await
    }

    async fn run<M, F>(&self, request: &UpdateRequest<M>, init: Option<F>) -> Result<Applied<M>>
    where
        M: Mutable,
        F: Fn() -> M + Send + Sync,
    {
        let target = &request.target;
        let _lock = self.locks.lock(target).await;

        for attempt in 1..=self.cas_retries {
            let current = match (self.store.load_fresh(target).await?, &init) {
                (Some(found), _) => found,
                (None, Some(make)) => match self.store.insert(target, make().into_aggregate()).await? {
                    Some(created) => created,
                    // Another process created it between our read and insert.
                    None => continue,
                },
                (None, None) => return Err(DomainError::NotFound(M::KIND, target.to_string())),
            };

            let Versioned { version, value } = current;
            let (next, changed) = request.apply_to(&narrow::<M>(target, value)?)?;
            if !changed {
                return Ok(Applied { value: next, changed, version });
            }

            match self.store.put(target, version, next.into_aggregate()).await? {
                Some(stored) => {
                    return Ok(Applied { value: narrow(target, stored.value)?, changed, version: stored.version });
                }
                None => debug!(attempt, version, "version moved underneath us"),
            }
        }

        warn!(id = %target, retries = self.cas_retries, "giving up on contended aggregate");
        Err(DomainError::conflict(format!("{target} kept changing; gave up after {} attempts", self.cas_retries)))
    }
}

/// Runs `op` until it succeeds, fails permanently, or has been retried
/// `retries` times on transient faults, backing off exponentially.
pub async fn retry_transient<T, F, Fut>(retries: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(what, attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(BACKOFF_BASE * 2u32.saturating_pow(attempt - 1)).await;
            }
            other => return other,
        }
    }
}
