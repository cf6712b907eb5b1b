//! # services
//!
//! The forum core proper: the aggregate store, the update dispatcher and
//! the engines built on them. Everything here talks to the outside world
//! only through the port traits in `domains`.

use std::sync::Arc;

use domains::{
    Applied, Article, CacheTier, Category, CredentialHasher, DurableStore, IdGenerator, Identifier, Mutable,
    RequestContext, Result, TokenCodec, UpdateRequest, User,
};

pub mod accounts;
pub mod dispatcher;
pub mod reconcile;
pub mod relations;
pub mod store;
pub mod text;
pub mod threads;

#[cfg(test)]
mod test_support;

pub use accounts::{AccountService, SettingsChange, Signup};
pub use dispatcher::{retry_transient, UpdateDispatcher};
pub use reconcile::{Fix, Reconciler, RepairReport};
pub use relations::RelationshipEngine;
pub use store::AggregateStore;
pub use text::IpHasher;
pub use threads::{Moderation, ThreadEngine};

/// Tunables of the engines. Mirrors the `limits` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_mentions: usize,
    pub max_tags: usize,
    /// Extra attempts per aggregate when a best-effort step hits a transient fault
    pub propagation_retries: u32,
    pub max_thread_depth: usize,
    pub cas_retries: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_mentions: 8, max_tags: 4, propagation_retries: 3, max_thread_depth: 1024, cas_retries: 8 }
    }
}

/// Everything the core needs from the outside, built once at startup.
pub struct CoreDeps {
    pub durable: Arc<dyn DurableStore>,
    pub cache: Arc<dyn CacheTier>,
    pub tokens: Arc<dyn TokenCodec>,
    pub hasher: Arc<dyn CredentialHasher>,
    /// Keys the IP digests
    pub ip_key: Vec<u8>,
    pub admin_name: String,
    pub limits: Limits,
}

/// The entry points HTTP-layer collaborators call.
pub struct ForumCore {
    pub store: Arc<AggregateStore>,
    pub dispatcher: Arc<UpdateDispatcher>,
    pub accounts: AccountService,
    pub threads: ThreadEngine,
    pub relations: RelationshipEngine,
    pub reconciler: Reconciler,
    ids: Arc<IdGenerator>,
    tokens: Arc<dyn TokenCodec>,
}

impl ForumCore {
    pub fn new(deps: CoreDeps) -> Result<Self> {
        let CoreDeps { durable, cache, tokens, hasher, ip_key, admin_name, limits } = deps;

        let ip = IpHasher::new(&ip_key)?;
        let ids = Arc::new(IdGenerator::new());
        let store = Arc::new(AggregateStore::new(durable, cache));
        let dispatcher = Arc::new(UpdateDispatcher::new(store.clone(), limits.cas_retries));

        Ok(Self {
            accounts: AccountService::new(dispatcher.clone(), tokens.clone(), hasher, ip.clone(), &admin_name),
            threads: ThreadEngine::new(dispatcher.clone(), ids.clone(), ip, limits.clone()),
            relations: RelationshipEngine::new(dispatcher.clone()),
            reconciler: Reconciler::new(dispatcher.clone(), limits.max_thread_depth),
            store,
            dispatcher,
            ids,
            tokens,
        })
    }

    pub fn new_id(&self, category: Category, scope: &str) -> Identifier {
        self.ids.new_id(category, scope)
    }

    /// Relation-set identifier for a method name (`follow`, `block`, `like`).
    pub fn make_id(&self, method: &str, subject: &str) -> Result<Identifier> {
        Identifier::relation_for(method, subject)
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        self.accounts.get_user(name).await
    }

    pub async fn get_article(&self, id: &Identifier) -> Result<Option<Article>> {
        self.threads.article(id).await
    }

    pub async fn get_user_by_context(&self, ctx: &RequestContext) -> Result<Option<User>> {
        self.accounts.get_user_by_context(ctx).await
    }

    /// Arbitrary typed mutation of one user or article.
    pub async fn apply<M: Mutable>(&self, request: &UpdateRequest<M>) -> Result<Applied<M>> {
        self.dispatcher.apply(request).await
    }

    pub fn make_user_token(&self, user: &User) -> String {
        self.tokens.make_user_token(user)
    }
}
