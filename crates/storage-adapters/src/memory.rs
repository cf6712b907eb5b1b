//! In-process implementations of `DurableStore` and `CacheTier`.
//!
//! The durable map is what tests and single-node deployments run on; the
//! cache is a bounded TTL map that also serves as the fallback cache when
//! no Redis endpoint is configured.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domains::{Aggregate, CacheTier, DomainError, DurableStore, Identifier, Result, Versioned};
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    rows: DashMap<Identifier, Versioned>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: while set, every write returns `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far (creates included).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DomainError::unavailable("durable store rejected write (injected fault)"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>> {
        Ok(self.rows.get(id).map(|row| row.value().clone()))
    }

    async fn create(&self, id: &Identifier, value: &Aggregate) -> Result<bool> {
        self.check_writable()?;
        match self.rows.entry(id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Versioned::new(Versioned::INITIAL, value.clone()));
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
    }

    async fn compare_and_put(&self, id: &Identifier, expected: u64, value: &Aggregate) -> Result<bool> {
        self.check_writable()?;
        match self.rows.get_mut(id) {
            Some(mut row) if row.version == expected => {
                *row = Versioned::new(expected + 1, value.clone());
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            Some(row) => {
                debug!(%id, expected, found = row.version, "version mismatch");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// Bounded TTL cache. When full, an arbitrary entry is evicted; older
/// versions never overwrite newer ones.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<Identifier, (Versioned, Instant)>,
    ttl: Duration,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: DashMap::new(), ttl, capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&self) {
        let expired = self
            .entries
            .iter()
            .find(|e| e.value().1.elapsed() >= self.ttl)
            .map(|e| e.key().clone());
        let victim = expired.or_else(|| self.entries.iter().next().map(|e| e.key().clone()));
        if let Some(victim) = victim {
            trace!(id = %victim, "cache eviction");
            self.entries.remove(&victim);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 100_000)
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>> {
        if let Some(hit) = self.entries.get(id) {
            if hit.value().1.elapsed() < self.ttl {
                return Ok(Some(hit.value().0.clone()));
            }
        }
        self.entries.remove_if(id, |_, (_, at)| at.elapsed() >= self.ttl);
        Ok(None)
    }

    async fn set(&self, id: &Identifier, value: &Versioned) -> Result<()> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(id) {
            self.evict_one();
        }
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().0.version <= value.version {
                    slot.insert((value.clone(), Instant::now()));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((value.clone(), Instant::now()));
            }
        }
        Ok(())
    }

    async fn invalidate(&self, id: &Identifier) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{Article, IdGenerator};

    fn article(id: &Identifier, likes: u32) -> Aggregate {
        let mut a = Article::new(id.clone(), "bob", "hi");
        a.likes = likes;
        Aggregate::Article(a)
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let store = MemoryDurableStore::new();
        let id = IdGenerator::new().next_article();
        assert!(store.create(&id, &article(&id, 0)).await.unwrap());
        assert!(!store.create(&id, &article(&id, 1)).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().unwrap().version, Versioned::INITIAL);
    }

    #[tokio::test]
    async fn compare_and_put_checks_version() {
        let store = MemoryDurableStore::new();
        let id = IdGenerator::new().next_article();
        store.create(&id, &article(&id, 0)).await.unwrap();

        assert!(store.compare_and_put(&id, 1, &article(&id, 1)).await.unwrap());
        assert!(!store.compare_and_put(&id, 1, &article(&id, 2)).await.unwrap());

        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.value, article(&id, 1));
    }

    #[tokio::test]
    async fn injected_fault_blocks_writes() {
        let store = MemoryDurableStore::new();
        let id = IdGenerator::new().next_article();
        store.create(&id, &article(&id, 0)).await.unwrap();
        store.set_fail_writes(true);
        assert!(store.compare_and_put(&id, 1, &article(&id, 5)).await.is_err());
        assert_eq!(store.get(&id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn cache_never_regresses_version() {
        let cache = MemoryCache::default();
        let id = IdGenerator::new().next_article();
        cache.set(&id, &Versioned::new(3, article(&id, 3))).await.unwrap();
        cache.set(&id, &Versioned::new(2, article(&id, 2))).await.unwrap();
        assert_eq!(cache.get(&id).await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn cache_respects_capacity_and_ttl() {
        let gen = IdGenerator::new();
        let cache = MemoryCache::new(Duration::from_secs(60), 2);
        for _ in 0..5 {
            let id = gen.next_article();
            cache.set(&id, &Versioned::new(1, article(&id, 0))).await.unwrap();
        }
        assert_eq!(cache.len(), 2);

        let expired = MemoryCache::new(Duration::ZERO, 10);
        let id = gen.next_article();
        expired.set(&id, &Versioned::new(1, article(&id, 0))).await.unwrap();
        assert!(expired.get(&id).await.unwrap().is_none());
        assert!(expired.is_empty());
    }
}
