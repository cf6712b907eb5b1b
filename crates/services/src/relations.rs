//! # Relationship Engine
//!
//! Like / follow / block toggles. Every predicate keeps a forward set keyed
//! by the subject; counted predicates also keep a reverse set keyed by the
//! object, plus a counter on the object aggregate.
//!
//! A toggle is three independent atomic steps, always in this order:
//! forward set, reverse set, counter. Both sets are always driven to the
//! requested state, so repeating a toggle after a partial failure heals it.
//! The counter moves only when the reverse set changed, and that is decided
//! inside the dispatcher's critical section, so racing identical toggles
//! move the counter at most once. Toggles of one subject and predicate are
//! serialised within the process; drift left by other processes or by a
//! failure between steps is repaired by
//! [`Reconciler`](crate::reconcile::Reconciler).

use std::sync::Arc;

use domains::{
    Article, ArticleUpdate, Category, DomainError, Identifier, RelationSet, RelationUpdate, Result, UpdateRequest,
    User, UserUpdate,
};
use tracing::{info, instrument, warn};

use crate::dispatcher::{KeyLocks, UpdateDispatcher};
use crate::store::AggregateStore;

/// Counter step of a counted predicate.
enum Counter {
    Likes(Identifier),
    Followers(Identifier),
}

struct Edge<'a> {
    forward: Identifier,
    object: &'a str,
    /// Reverse set and counter, for counted predicates
    reverse: Option<(Identifier, &'a str, Counter)>,
}

pub struct RelationshipEngine {
    dispatcher: Arc<UpdateDispatcher>,
    /// Keyed by forward set
    toggles: KeyLocks,
}

fn membership(key: &Identifier, member: &str, on: bool) -> UpdateRequest<RelationSet> {
    let update = if on {
        RelationUpdate::Insert(member.to_string())
    } else {
        RelationUpdate::Remove(member.to_string())
    };
    UpdateRequest::new(key.clone()).with(update)
}

impl RelationshipEngine {
    pub fn new(dispatcher: Arc<UpdateDispatcher>) -> Self {
        Self { dispatcher, toggles: KeyLocks::default() }
    }

    fn store(&self) -> &AggregateStore {
        self.dispatcher.store()
    }

    async fn set_membership(&self, key: &Identifier, member: &str, on: bool) -> Result<bool> {
        let applied = self
            .dispatcher
            .upsert(&membership(key, member, on), || RelationSet::empty(key.clone()))
            .await?;
        Ok(applied.changed)
    }

    /// Returns whether the forward edge changed state.
    async fn toggle(&self, edge: Edge<'_>, on: bool) -> Result<bool> {
        let _serial = self.toggles.lock(&edge.forward).await;
        let forward_changed = self.set_membership(&edge.forward, edge.object, on).await?;

        let Some((reverse, subject, counter)) = edge.reverse else {
            return Ok(forward_changed);
        };

        let reverse_changed = self.set_membership(&reverse, subject, on).await.inspect_err(|err| {
            warn!(forward = %edge.forward, %reverse, error = %err, "edge written but reverse set update failed");
        })?;
        if !reverse_changed {
            // The reverse set already agreed; the counter tracks it.
            return Ok(forward_changed);
        }
        if !forward_changed {
            info!(forward = %edge.forward, %reverse, "reverse set caught up with forward edge");
        }

        let delta = if on { 1 } else { -1 };
        let counted = match &counter {
            Counter::Likes(article) => self
                .dispatcher
                .apply(&UpdateRequest::<Article>::new(article.clone()).with(ArticleUpdate::AdjustLikes(delta)))
                .await
                .map(|_| ()),
            Counter::Followers(user) => self
                .dispatcher
                .apply(&UpdateRequest::<User>::new(user.clone()).with(UserUpdate::AdjustFollowers(delta)))
                .await
                .map(|_| ()),
        };
        counted.inspect_err(|err| {
            warn!(forward = %edge.forward, %reverse, error = %err, "edge written but counter update failed");
        })?;
        Ok(forward_changed)
    }

    async fn require_user(&self, name: &str) -> Result<()> {
        match self.store().get_typed::<User>(&Identifier::user(name)).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::NotFound("user", name.to_string())),
        }
    }

    /// Adds or removes `user -likes-> article`. Returns whether anything
    /// changed; repeating a toggle is a no-op.
    #[instrument(skip(self, article), fields(%article))]
    pub async fn like_article(&self, user_id: &str, article: &Identifier, like: bool) -> Result<bool> {
        if article.category() != Category::Article {
            return Err(DomainError::validation(format!("{article} is not an article")));
        }
        if self.store().get_typed::<Article>(article).await?.is_none() {
            return Err(DomainError::NotFound("article", article.to_string()));
        }

        let edge = Edge {
            forward: Identifier::scoped(Category::Liking, user_id),
            object: article.as_str(),
            reverse: Some((
                Identifier::scoped(Category::Likers, article.as_str()),
                user_id,
                Counter::Likes(article.clone()),
            )),
        };
        let changed = self.toggle(edge, like).await?;
        if changed {
            info!(user_id, like, "like toggled");
        }
        Ok(changed)
    }

    /// Adds or removes `user -follows-> target`. Self-follow is rejected.
    #[instrument(skip(self))]
    pub async fn follow_user(&self, user_id: &str, target: &str, follow: bool) -> Result<bool> {
        if user_id == target {
            return Err(DomainError::validation("cannot follow yourself"));
        }
        self.require_user(target).await?;

        let edge = Edge {
            forward: Identifier::scoped(Category::Following, user_id),
            object: target,
            reverse: Some((
                Identifier::scoped(Category::Followers, target),
                user_id,
                Counter::Followers(Identifier::user(target)),
            )),
        };
        let changed = self.toggle(edge, follow).await?;
        if changed {
            info!(follow, "follow toggled");
        }
        Ok(changed)
    }

    /// Adds or removes `user -blocks-> target`. Blocks are not counted.
    #[instrument(skip(self))]
    pub async fn block_user(&self, user_id: &str, target: &str, block: bool) -> Result<bool> {
        if user_id == target {
            return Err(DomainError::validation("cannot block yourself"));
        }
        self.require_user(target).await?;

        let edge = Edge { forward: Identifier::scoped(Category::Blocking, user_id), object: target, reverse: None };
        let changed = self.toggle(edge, block).await?;
        if changed {
            info!(block, "block toggled");
        }
        Ok(changed)
    }

    async fn members(&self, category: Category, subject: &str) -> Result<Vec<String>> {
        let key = Identifier::scoped(category, subject);
        Ok(self
            .store()
            .get_typed::<RelationSet>(&key)
            .await?
            .map(|set| set.members.into_iter().collect())
            .unwrap_or_default())
    }

    /// Members of the relation set `MakeID(method, subject)` points at.
    pub async fn list(&self, method: &str, subject: &str) -> Result<Vec<String>> {
        let key = Identifier::relation_for(method, subject)?;
        self.members(key.category(), subject).await
    }

    pub async fn following(&self, user_id: &str) -> Result<Vec<String>> {
        self.members(Category::Following, user_id).await
    }

    pub async fn followers(&self, user_id: &str) -> Result<Vec<String>> {
        self.members(Category::Followers, user_id).await
    }

    pub async fn blocked(&self, user_id: &str) -> Result<Vec<String>> {
        self.members(Category::Blocking, user_id).await
    }

    /// Liked article identifiers, as strings.
    pub async fn liked(&self, user_id: &str) -> Result<Vec<String>> {
        self.members(Category::Liking, user_id).await
    }

    pub async fn likers(&self, article: &Identifier) -> Result<Vec<String>> {
        self.members(Category::Likers, article.as_str()).await
    }

    pub async fn is_blocked(&self, user_id: &str, target: &str) -> Result<bool> {
        let key = Identifier::scoped(Category::Blocking, user_id);
        Ok(self
            .store()
            .get_typed::<RelationSet>(&key)
            .await?
            .is_some_and(|set| set.contains(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{faulty_dispatcher, memory_dispatcher, user};
    use domains::IdGenerator;
    use storage_adapters::MemoryDurableStore;

    async fn engine() -> (Arc<MemoryDurableStore>, Arc<UpdateDispatcher>, RelationshipEngine) {
        let (durable, dispatcher) = memory_dispatcher();
        for name in ["alice", "bob"] {
            dispatcher.create(&Identifier::user(name), user(name)).await.unwrap();
        }
        (durable, dispatcher.clone(), RelationshipEngine::new(dispatcher))
    }

    async fn followers_of(d: &UpdateDispatcher, name: &str) -> u32 {
        d.store().get_typed::<User>(&Identifier::user(name)).await.unwrap().unwrap().followers
    }

    #[tokio::test]
    async fn like_is_idempotent() {
        let (_, d, rel) = engine().await;
        let id = IdGenerator::new().next_article();
        d.create(&id, Article::new(id.clone(), "bob", "A1")).await.unwrap();

        assert!(rel.like_article("alice", &id, true).await.unwrap());
        assert!(!rel.like_article("alice", &id, true).await.unwrap());

        let a = d.store().get_typed::<Article>(&id).await.unwrap().unwrap();
        assert_eq!(a.likes, 1);
        assert_eq!(rel.liked("alice").await.unwrap(), vec![id.to_string()]);
        assert_eq!(rel.likers(&id).await.unwrap(), vec!["alice".to_string()]);

        assert!(rel.like_article("alice", &id, false).await.unwrap());
        assert!(!rel.like_article("alice", &id, false).await.unwrap());
        let a = d.store().get_typed::<Article>(&id).await.unwrap().unwrap();
        assert_eq!(a.likes, 0);
    }

    #[tokio::test]
    async fn like_needs_an_existing_article() {
        let (_, _, rel) = engine().await;
        let id = IdGenerator::new().next_article();
        assert!(matches!(rel.like_article("alice", &id, true).await, Err(DomainError::NotFound(..))));
        let not_article = Identifier::user("bob");
        assert!(matches!(rel.like_article("alice", &not_article, true).await, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn follow_round_trip_restores_state() {
        let (_, d, rel) = engine().await;

        assert!(rel.follow_user("alice", "bob", true).await.unwrap());
        assert_eq!(followers_of(&d, "bob").await, 1);
        assert_eq!(rel.following("alice").await.unwrap(), vec!["bob"]);
        assert_eq!(rel.followers("bob").await.unwrap(), vec!["alice"]);
        assert_eq!(rel.list("follow", "alice").await.unwrap(), vec!["bob"]);

        assert!(rel.follow_user("alice", "bob", false).await.unwrap());
        assert_eq!(followers_of(&d, "bob").await, 0);
        assert!(rel.following("alice").await.unwrap().is_empty());
        assert!(rel.followers("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_edges_are_rejected() {
        let (_, _, rel) = engine().await;
        assert!(matches!(rel.follow_user("alice", "alice", true).await, Err(DomainError::Validation(_))));
        assert!(matches!(rel.block_user("bob", "bob", true).await, Err(DomainError::Validation(_))));
        assert!(matches!(rel.follow_user("alice", "nobody", true).await, Err(DomainError::NotFound(..))));
    }

    #[tokio::test]
    async fn block_is_uncounted() {
        let (_, d, rel) = engine().await;
        assert!(rel.block_user("alice", "bob", true).await.unwrap());
        assert!(rel.is_blocked("alice", "bob").await.unwrap());
        assert!(!rel.is_blocked("bob", "alice").await.unwrap());
        assert_eq!(rel.blocked("alice").await.unwrap(), vec!["bob"]);
        assert_eq!(followers_of(&d, "bob").await, 0);

        assert!(rel.block_user("alice", "bob", false).await.unwrap());
        assert!(!rel.is_blocked("alice", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn racing_identical_toggles_count_once() {
        let (_, d, rel) = engine().await;
        let rel = Arc::new(rel);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let rel = rel.clone();
                tokio::spawn(async move { rel.follow_user("alice", "bob", true).await })
            })
            .collect();

        let mut changed = 0;
        for t in tasks {
            if t.await.unwrap().unwrap() {
                changed += 1;
            }
        }
        assert_eq!(changed, 1);
        assert_eq!(followers_of(&d, "bob").await, 1);
    }

    #[tokio::test]
    async fn failed_forward_write_changes_nothing() {
        let (durable, d, rel) = engine().await;
        durable.set_fail_writes(true);
        assert!(rel.follow_user("alice", "bob", true).await.unwrap_err().is_transient());
        durable.set_fail_writes(false);

        assert!(rel.following("alice").await.unwrap().is_empty());
        assert_eq!(followers_of(&d, "bob").await, 0);
    }

    #[tokio::test]
    async fn retry_heals_a_failed_reverse_step() {
        let (faults, d) = faulty_dispatcher();
        for name in ["alice", "bob"] {
            d.create(&Identifier::user(name), user(name)).await.unwrap();
        }
        let a1 = IdGenerator::new().next_article();
        d.create(&a1, Article::new(a1.clone(), "bob", "A1")).await.unwrap();
        let rel = RelationshipEngine::new(d.clone());

        faults.fail(&[Category::Followers, Category::Likers]);
        assert!(rel.follow_user("alice", "bob", true).await.unwrap_err().is_transient());
        assert!(rel.like_article("alice", &a1, true).await.unwrap_err().is_transient());
        assert_eq!(rel.following("alice").await.unwrap(), vec!["bob"]);
        assert!(rel.followers("bob").await.unwrap().is_empty());

        faults.fail(&[]);
        // The forward edge is already there, so nothing new is reported.
        assert!(!rel.follow_user("alice", "bob", true).await.unwrap());
        assert!(!rel.like_article("alice", &a1, true).await.unwrap());

        assert_eq!(rel.followers("bob").await.unwrap(), vec!["alice"]);
        assert_eq!(followers_of(&d, "bob").await, 1);
        assert_eq!(rel.likers(&a1).await.unwrap(), vec!["alice"]);
        let a = d.store().get_typed::<Article>(&a1).await.unwrap().unwrap();
        assert_eq!(a.likes, 1);

        // Unlike after the heal moves the counter back exactly once.
        assert!(rel.like_article("alice", &a1, false).await.unwrap());
        let a = d.store().get_typed::<Article>(&a1).await.unwrap().unwrap();
        assert_eq!(a.likes, 0);
    }

    #[tokio::test]
    async fn opposite_toggles_racing_leave_consistent_sets() {
        let (_, d, rel) = engine().await;
        let rel = Arc::new(rel);
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let rel = rel.clone();
                tokio::spawn(async move { rel.follow_user("alice", "bob", i % 2 == 0).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let following = rel.following("alice").await.unwrap();
        let followers = rel.followers("bob").await.unwrap();
        assert_eq!(following.is_empty(), followers.is_empty());
        assert_eq!(followers_of(&d, "bob").await as usize, followers.len());
    }
}
