//! # Aggregate Store
//!
//! Cache-first reads, write-through writes. The durable store is the only
//! source of truth; the cache is an accelerator that may be stale, evicted
//! or unreachable without changing any outcome.

use std::sync::Arc;

use domains::{Aggregate, CacheTier, DomainError, DurableStore, Identifier, Mutable, Result, Versioned};
use tracing::{debug, error, warn};

pub struct AggregateStore {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn CacheTier>,
}

/// Narrows a stored aggregate to the kind the caller asked for.
pub(crate) fn narrow<M: Mutable>(id: &Identifier, value: Aggregate) -> Result<M> {
    let found = value.kind();
    M::from_aggregate(value)
        .ok_or_else(|| DomainError::validation(format!("{id} holds a {found}, not a {}", M::KIND)))
}

impl AggregateStore {
    pub fn new(durable: Arc<dyn DurableStore>, cache: Arc<dyn CacheTier>) -> Self {
        Self { durable, cache }
    }

    /// Cache-first read. A durable miss is `None`, never an error.
    pub async fn get(&self, id: &Identifier) -> Result<Option<Aggregate>> {
        Ok(self.get_versioned(id).await?.map(|v| v.value))
    }

    pub async fn get_versioned(&self, id: &Identifier) -> Result<Option<Versioned>> {
        match self.cache.get(id).await {
            Ok(Some(hit)) => {
                debug!(%id, version = hit.version, "cache hit");
                return Ok(Some(hit));
            }
            Ok(None) => debug!(%id, "cache miss"),
            Err(err) => warn!(%id, error = %err, "cache read failed, falling back to durable store"),
        }

        let Some(found) = self.durable.get(id).await? else {
            return Ok(None);
        };
        if let Err(err) = self.cache.set(id, &found).await {
            warn!(%id, error = %err, "cache populate failed");
        }
        Ok(Some(found))
    }

    pub async fn get_typed<M: Mutable>(&self, id: &Identifier) -> Result<Option<M>> {
        self.get(id).await?.map(|agg| narrow(id, agg)).transpose()
    }

    /// Durable-only read, bypassing the cache. Read-modify-write cycles
    /// start from here.
    pub async fn load_fresh(&self, id: &Identifier) -> Result<Option<Versioned>> {
        self.durable.get(id).await
    }

    /// Inserts a new aggregate. Returns `None` when the key already exists.
    pub async fn insert(&self, id: &Identifier, value: Aggregate) -> Result<Option<Versioned>> {
        if !self.durable.create(id, &value).await? {
            return Ok(None);
        }
        let stored = Versioned::new(Versioned::INITIAL, value);
        self.write_through(id, &stored).await;
        Ok(Some(stored))
    }

    /// Like [`insert`](Self::insert), but a duplicate key is a `Conflict`.
    pub async fn create(&self, id: &Identifier, value: Aggregate) -> Result<Versioned> {
        self.insert(id, value)
            .await?
            .ok_or_else(|| DomainError::conflict(format!("{id} already exists")))
    }

    /// Conditional full-aggregate write. `None` means the stored version is
    /// no longer `expected` and nothing was written. A durable failure leaves
    /// the cache untouched.
    pub async fn put(&self, id: &Identifier, expected: u64, value: Aggregate) -> Result<Option<Versioned>> {
        if !self.durable.compare_and_put(id, expected, &value).await? {
            return Ok(None);
        }
        let stored = Versioned::new(expected + 1, value);
        self.write_through(id, &stored).await;
        Ok(Some(stored))
    }

    /// The durable write already happened; a cache that cannot take the new
    /// value must at least forget the old one.
    async fn write_through(&self, id: &Identifier, stored: &Versioned) {
        let Err(err) = self.cache.set(id, stored).await else {
            return;
        };
        warn!(%id, error = %err, "cache set failed after durable write, invalidating");
        if let Err(err) = self.cache.invalidate(id).await {
            error!(%id, error = %err, "cache invalidate failed; entry may serve stale data until it expires");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Article, IdGenerator, MockCacheTier, MockDurableStore};
    use storage_adapters::{MemoryCache, MemoryDurableStore};

    fn article() -> (Identifier, Aggregate) {
        let id = IdGenerator::new().next_article();
        let agg = Aggregate::Article(Article::new(id.clone(), "bob", "hello"));
        (id, agg)
    }

    fn memory() -> (Arc<MemoryDurableStore>, Arc<MemoryCache>, AggregateStore) {
        let durable = Arc::new(MemoryDurableStore::new());
        let cache = Arc::new(MemoryCache::default());
        let store = AggregateStore::new(durable.clone(), cache.clone());
        (durable, cache, store)
    }

    #[tokio::test]
    async fn miss_is_none_not_error() {
        let (_, _, store) = memory();
        let (id, _) = article();
        assert_eq!(store.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_writes_through_and_rejects_duplicates() {
        let (_, cache, store) = memory();
        let (id, agg) = article();

        let stored = store.create(&id, agg.clone()).await.unwrap();
        assert_eq!(stored.version, Versioned::INITIAL);
        assert_eq!(cache.get(&id).await.unwrap(), Some(stored));

        let err = store.create(&id, agg).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn durable_read_populates_cache() {
        let (durable, cache, store) = memory();
        let (id, agg) = article();
        durable.create(&id, &agg).await.unwrap();

        assert_eq!(cache.get(&id).await.unwrap(), None);
        assert_eq!(store.get(&id).await.unwrap(), Some(agg));
        assert!(cache.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_put_writes_nothing() {
        let (_, _, store) = memory();
        let (id, agg) = article();
        store.create(&id, agg.clone()).await.unwrap();

        assert!(store.put(&id, 1, agg.clone()).await.unwrap().is_some());
        assert!(store.put(&id, 1, agg).await.unwrap().is_none());
        assert_eq!(store.get_versioned(&id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn typed_read_rejects_wrong_kind() {
        let (_, _, store) = memory();
        let (id, agg) = article();
        store.create(&id, agg).await.unwrap();
        assert!(store.get_typed::<Article>(&id).await.unwrap().is_some());
        let err = store.get_typed::<domains::User>(&id).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn unreachable_cache_falls_back_to_durable() {
        let (id, agg) = article();
        let stored = Versioned::new(3, agg);

        let mut cache = MockCacheTier::new();
        cache.expect_get().returning(|_| Err(DomainError::unavailable("redis down")));
        cache.expect_set().returning(|_, _| Err(DomainError::unavailable("redis down")));

        let mut durable = MockDurableStore::new();
        let returned = stored.clone();
        durable.expect_get().times(1).returning(move |_| Ok(Some(returned.clone())));

        let store = AggregateStore::new(Arc::new(durable), Arc::new(cache));
        assert_eq!(store.get_versioned(&id).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn failed_durable_write_leaves_cache_alone() {
        let (id, agg) = article();

        let mut durable = MockDurableStore::new();
        durable
            .expect_compare_and_put()
            .returning(|_, _, _| Err(DomainError::unavailable("disk full")));

        let mut cache = MockCacheTier::new();
        cache.expect_set().never();
        cache.expect_invalidate().never();

        let store = AggregateStore::new(Arc::new(durable), Arc::new(cache));
        let err = store.put(&id, 1, agg).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn failed_cache_set_invalidates() {
        let (id, agg) = article();

        let mut durable = MockDurableStore::new();
        durable.expect_compare_and_put().returning(|_, _, _| Ok(true));

        let mut cache = MockCacheTier::new();
        cache.expect_set().returning(|_, _| Err(DomainError::unavailable("timeout")));
        cache.expect_invalidate().times(1).returning(|_| Ok(()));

        let store = AggregateStore::new(Arc::new(durable), Arc::new(cache));
        let stored = store.put(&id, 4, agg).await.unwrap().unwrap();
        assert_eq!(stored.version, 5);
    }
}
