//! Fixtures shared by the unit tests of this crate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use domains::{
    Aggregate, Category, DomainError, DurableStore, Identifier, IpHistory, Result, Role, User, UserSettings, Versioned,
};
use storage_adapters::{MemoryCache, MemoryDurableStore};

use crate::dispatcher::UpdateDispatcher;
use crate::store::AggregateStore;

pub(crate) fn user(name: &str) -> User {
    User {
        id: name.to_string(),
        session: "s0".to_string(),
        email: String::new(),
        password_hash: "x".to_string(),
        recent_ips: IpHistory::with_anchor("ip"),
        signup_at: Utc::now(),
        login_at: Utc::now(),
        kimochi: 0,
        settings: UserSettings::default(),
        avatar: 0,
        role: Role::User,
        banned: false,
        followers: 0,
        unread_mentions: 0,
    }
}

pub(crate) fn memory_dispatcher() -> (Arc<MemoryDurableStore>, Arc<UpdateDispatcher>) {
    let durable = Arc::new(MemoryDurableStore::new());
    let store = AggregateStore::new(durable.clone(), Arc::new(MemoryCache::default()));
    (durable, Arc::new(UpdateDispatcher::new(Arc::new(store), 8)))
}

/// In-memory durable store whose writes fail for selected categories only.
#[derive(Default)]
pub(crate) struct CategoryFaults {
    inner: MemoryDurableStore,
    failing: Mutex<HashSet<Category>>,
}

impl CategoryFaults {
    pub(crate) fn fail(&self, categories: &[Category]) {
        *self.failing.lock().unwrap() = categories.iter().copied().collect();
    }

    fn check(&self, id: &Identifier) -> Result<()> {
        if self.failing.lock().unwrap().contains(&id.category()) {
            return Err(DomainError::unavailable(format!("injected write fault for {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for CategoryFaults {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>> {
        self.inner.get(id).await
    }

    async fn create(&self, id: &Identifier, value: &Aggregate) -> Result<bool> {
        self.check(id)?;
        self.inner.create(id, value).await
    }

    async fn compare_and_put(&self, id: &Identifier, expected: u64, value: &Aggregate) -> Result<bool> {
        self.check(id)?;
        self.inner.compare_and_put(id, expected, value).await
    }
}

pub(crate) fn faulty_dispatcher() -> (Arc<CategoryFaults>, Arc<UpdateDispatcher>) {
    let durable = Arc::new(CategoryFaults::default());
    let store = AggregateStore::new(durable.clone(), Arc::new(MemoryCache::default()));
    (durable, Arc::new(UpdateDispatcher::new(Arc::new(store), 8)))
}
