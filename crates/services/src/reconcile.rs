//! # Reconciliation
//!
//! Recomputes derived counters from the data they summarise and rewrites
//! the ones that drifted. Every repair is idempotent: running it twice in a
//! row writes nothing the second time.
//!
//! Reverse relation sets (likers, followers) are first checked member by
//! member against the members' own forward sets; members whose forward
//! edge is gone are dropped before the counter is recounted.
//!
//! Repairs read the durable store directly. A reply or like that lands
//! while a repair is running may be overwritten by the recomputed value;
//! the next pass counts it again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use domains::{
    Article, ArticleUpdate, Category, DomainError, Identifier, Mutable, RelationSet, RelationUpdate, Result,
    UpdateRequest, User, UserUpdate,
};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::UpdateDispatcher;
use crate::store::narrow;

/// One counter that was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fix {
    pub id: Identifier,
    pub field: &'static str,
    pub was: u32,
    pub now: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub examined: usize,
    pub fixed: Vec<Fix>,
    pub failed: usize,
}

impl RepairReport {
    pub fn merge(&mut self, other: RepairReport) {
        self.examined += other.examined;
        self.fixed.extend(other.fixed);
        self.failed += other.failed;
    }

    pub fn is_clean(&self) -> bool {
        self.fixed.is_empty() && self.failed == 0
    }
}

pub struct Reconciler {
    dispatcher: Arc<UpdateDispatcher>,
    max_depth: usize,
}

fn len32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Reconciler {
    pub fn new(dispatcher: Arc<UpdateDispatcher>, max_depth: usize) -> Self {
        Self { dispatcher, max_depth }
    }

    async fn load<M: Mutable>(&self, id: &Identifier) -> Result<Option<M>> {
        match self.dispatcher.store().load_fresh(id).await? {
            Some(found) => narrow(id, found.value).map(Some),
            None => Ok(None),
        }
    }

    async fn rewrite<M: Mutable>(&self, report: &mut RepairReport, fix: Fix, update: M::Update) {
        let req = UpdateRequest::<M>::new(fix.id.clone()).with(update);
        match self.dispatcher.apply(&req).await {
            Ok(_) => {
                info!(id = %fix.id, field = fix.field, was = fix.was, now = fix.now, "counter repaired");
                report.fixed.push(fix);
            }
            Err(err) => {
                error!(id = %fix.id, field = fix.field, error = %err, "counter repair failed");
                report.failed += 1;
            }
        }
    }

    /// Drops members of the `reverse` set whose own `forward` set no longer
    /// holds `object`. Returns the size of the set as stored afterwards.
    async fn prune(
        &self,
        report: &mut RepairReport,
        reverse: &Identifier,
        forward: Category,
        object: &str,
    ) -> Result<u32> {
        let Some(set) = self.load::<RelationSet>(reverse).await? else {
            return Ok(0);
        };
        let mut req = UpdateRequest::<RelationSet>::new(reverse.clone());
        for member in &set.members {
            let edge = self.load::<RelationSet>(&Identifier::scoped(forward, member)).await?;
            if !edge.is_some_and(|e| e.contains(object)) {
                debug!(%reverse, member = %member, "reverse entry without forward edge");
                req = req.with(RelationUpdate::Remove(member.clone()));
            }
        }
        if req.updates.is_empty() {
            return Ok(len32(set.len()));
        }

        let was = len32(set.len());
        match self.dispatcher.apply(&req).await {
            Ok(applied) => {
                let now = len32(applied.value.len());
                info!(%reverse, was, now, "stale relation members dropped");
                report.fixed.push(Fix { id: reverse.clone(), field: "members", was, now });
                Ok(now)
            }
            Err(err) => {
                error!(%reverse, error = %err, "relation set repair failed");
                report.failed += 1;
                Ok(was)
            }
        }
    }

    /// Rebuilds the reply counters of `root` and every descendant from the
    /// `children` links. Nodes deeper than the depth limit keep their
    /// stored counter and are trusted as-is.
    #[instrument(skip(self, root), fields(%root))]
    pub async fn repair_thread(&self, root: &Identifier) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut order: Vec<Article> = Vec::new();
        let mut totals: HashMap<Identifier, u32> = HashMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(root.clone(), 0usize)];

        while let Some((id, depth)) = stack.pop() {
            if !seen.insert(id.clone()) {
                warn!(%id, "article linked twice, skipping");
                continue;
            }
            let Some(article) = self.load::<Article>(&id).await? else {
                if id == *root {
                    return Err(DomainError::NotFound("article", id.to_string()));
                }
                warn!(%id, "linked reply is missing");
                continue;
            };
            report.examined += 1;
            if depth >= self.max_depth {
                totals.insert(id, article.replies);
                continue;
            }
            stack.extend(article.children.iter().map(|c| (c.clone(), depth + 1)));
            order.push(article);
        }

        // Children always come after their parent in `order`.
        for article in order.iter().rev() {
            let total = article
                .children
                .iter()
                .map(|c| totals.get(c).map_or(0, |t| t.saturating_add(1)))
                .fold(0u32, u32::saturating_add);
            totals.insert(article.id.clone(), total);

            if article.replies != total {
                let fix = Fix { id: article.id.clone(), field: "replies", was: article.replies, now: total };
                self.rewrite::<Article>(&mut report, fix, ArticleUpdate::SetReplies(total)).await;
            }
        }
        debug!(examined = report.examined, fixed = report.fixed.len(), "thread checked");
        Ok(report)
    }

    /// Sets an article's like counter to the size of its likers set, after
    /// dropping likers whose own liked set lacks the article.
    #[instrument(skip(self, article), fields(%article))]
    pub async fn repair_likes(&self, article: &Identifier) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let found = self
            .load::<Article>(article)
            .await?
            .ok_or_else(|| DomainError::NotFound("article", article.to_string()))?;
        report.examined = 1;
        let reverse = Identifier::scoped(Category::Likers, article.as_str());
        let likers = self.prune(&mut report, &reverse, Category::Liking, article.as_str()).await?;

        if found.likes != likers {
            let fix = Fix { id: article.clone(), field: "likes", was: found.likes, now: likers };
            self.rewrite::<Article>(&mut report, fix, ArticleUpdate::SetLikes(likers)).await;
        }
        Ok(report)
    }

    /// Sets a user's follower counter to the size of its followers set, after
    /// dropping followers who no longer follow the user.
    #[instrument(skip(self))]
    pub async fn repair_followers(&self, user_id: &str) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let key = Identifier::user(user_id);
        let found = self
            .load::<User>(&key)
            .await?
            .ok_or_else(|| DomainError::NotFound("user", user_id.to_string()))?;
        report.examined = 1;
        let reverse = Identifier::scoped(Category::Followers, user_id);
        let followers = self.prune(&mut report, &reverse, Category::Following, user_id).await?;

        if found.followers != followers {
            let fix = Fix { id: key, field: "followers", was: found.followers, now: followers };
            self.rewrite::<User>(&mut report, fix, UserUpdate::SetFollowers(followers)).await;
        }
        Ok(report)
    }

    /// Dispatches on the identifier's category: articles get their thread
    /// and likes repaired, users their followers.
    pub async fn repair(&self, id: &Identifier) -> Result<RepairReport> {
        match id.category() {
            Category::Article => {
                let mut report = self.repair_thread(id).await?;
                report.merge(self.repair_likes(id).await?);
                Ok(report)
            }
            Category::User => self.repair_followers(&id.scope()).await,
            other => Err(DomainError::validation(format!("nothing to reconcile for {other} identifiers"))),
        }
    }
}
