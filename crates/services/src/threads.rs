//! # Thread Engine
//!
//! Top-level posts, replies, and the counters hanging off them.
//!
//! A reply is linked to its parent in one atomic request (child appended,
//! counter bumped), so a locked parent can never gain a child. The rest of
//! the ancestor chain is walked afterwards, one aggregate at a time, with
//! bounded retry on transient faults; an interrupted walk leaves counters
//! understated until the reconciliation pass runs.

use std::collections::HashSet;
use std::sync::Arc;

use domains::{
    Article, ArticleUpdate, Category, DomainError, IdGenerator, Identifier, Result, UpdateRequest, User, UserUpdate,
};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::{retry_transient, UpdateDispatcher};
use crate::store::AggregateStore;
use crate::text::{extract_mentions, extract_tags, sanitize_username, IpHasher};
use crate::Limits;

/// Moderation actions on a single article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moderation {
    Nsfw(bool),
    Lock(bool),
    Delete,
}

impl Moderation {
    fn update(self) -> ArticleUpdate {
        match self {
            Moderation::Nsfw(v) => ArticleUpdate::SetNsfw(v),
            Moderation::Lock(v) => ArticleUpdate::SetLocked(v),
            Moderation::Delete => ArticleUpdate::MarkDeleted,
        }
    }
}

pub struct ThreadEngine {
    dispatcher: Arc<UpdateDispatcher>,
    ids: Arc<IdGenerator>,
    ip: IpHasher,
    limits: Limits,
}

impl ThreadEngine {
    pub fn new(dispatcher: Arc<UpdateDispatcher>, ids: Arc<IdGenerator>, ip: IpHasher, limits: Limits) -> Self {
        Self { dispatcher, ids, ip, limits }
    }

    fn store(&self) -> &AggregateStore {
        self.dispatcher.store()
    }

    /// Ban state is read from the store; the caller's copy may predate a ban.
    async fn check_author(&self, author: &User, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(DomainError::validation("content must not be empty"));
        }
        let stored = self
            .store()
            .get_typed::<User>(&Identifier::user(&author.id))
            .await?
            .ok_or_else(|| DomainError::NotFound("user", author.id.clone()))?;
        if stored.banned {
            return Err(DomainError::validation(format!("{} is banned", author.id)));
        }
        Ok(())
    }

    fn draft(&self, author: &User, content: &str, ip: &str) -> Article {
        let mut article = Article::new(self.ids.next_article(), author.id.as_str(), content);
        article.ip_hash = self.ip.hash(ip);
        article
    }

    pub async fn article(&self, id: &Identifier) -> Result<Option<Article>> {
        self.store().get_typed(id).await
    }

    /// Publishes a top-level article and bumps the author and tag indexes.
    #[instrument(skip_all, fields(author = %author.id))]
    pub async fn post(&self, author: &User, content: &str, ip: &str, nsfw: bool) -> Result<Identifier> {
        self.check_author(author, content).await?;

        let mut article = self.draft(author, content, ip);
        article.nsfw = nsfw;
        article.tags = extract_tags(content, self.limits.max_tags);
        let id = article.id.clone();
        let tags = article.tags.clone();

        self.dispatcher.create(&id, article).await?;
        info!(%id, "article posted");

        self.bump_index(Identifier::author(&author.id)).await;
        for tag in &tags {
            self.bump_index(Identifier::tag(tag)).await;
        }
        self.notify_mentions(author, content).await;
        Ok(id)
    }

    /// Publishes a reply under `parent` and propagates the reply counter to
    /// every ancestor. Missing, locked and deleted parents are `NotFound`.
    #[instrument(skip_all, fields(author = %author.id, %parent))]
    pub async fn post_reply(&self, parent: &Identifier, author: &User, content: &str, ip: &str) -> Result<Identifier> {
        self.check_author(author, content).await?;
        self.open_parent(parent).await?;

        let mut child = self.draft(author, content, ip);
        child.parent = Some(parent.clone());
        let id = child.id.clone();
        self.dispatcher.create(&id, child).await?;

        let link = UpdateRequest::<Article>::new(parent.clone())
            .with(ArticleUpdate::AppendChild(id.clone()))
            .with(ArticleUpdate::IncrementReplies(1));
        let linked = match retry_transient(self.limits.propagation_retries, "link reply", || self.dispatcher.apply(&link))
            .await
        {
            Ok(applied) => applied.value,
            Err(err) => {
                // Parent got locked (or the store failed) after the child was
                // written; the orphan must not show up anywhere.
                warn!(%id, error = %err, "parent rejected reply, retracting it");
                let retract = UpdateRequest::<Article>::new(id.clone()).with(ArticleUpdate::MarkDeleted);
                if let Err(retract_err) = self.dispatcher.apply(&retract).await {
                    error!(%id, error = %retract_err, "failed to retract orphaned reply");
                }
                return Err(err);
            }
        };
        info!(%id, "reply posted");

        self.propagate(&id, &linked).await;
        self.notify_mentions(author, content).await;
        Ok(id)
    }

    async fn open_parent(&self, parent: &Identifier) -> Result<Article> {
        let missing = || DomainError::NotFound("article", parent.to_string());
        if parent.category() != Category::Article {
            return Err(missing());
        }
        match self.article(parent).await? {
            Some(found) if !found.locked && !found.deleted => Ok(found),
            _ => Err(missing()),
        }
    }

    /// Increments every ancestor above `parent`. Returns how many ancestors
    /// (the direct parent included) now count the new reply.
    async fn propagate(&self, child: &Identifier, parent: &Article) -> usize {
        let mut visited = HashSet::from([child.clone(), parent.id.clone()]);
        let mut counted = 1;
        let mut next = parent.parent.clone();

        while let Some(ancestor) = next.take() {
            if counted >= self.limits.max_thread_depth {
                warn!(%child, depth = counted, "thread depth limit reached, propagation stopped");
                break;
            }
            if !visited.insert(ancestor.clone()) {
                error!(%child, %ancestor, "ancestor chain loops back on itself, propagation stopped");
                break;
            }

            let bump = UpdateRequest::<Article>::new(ancestor.clone()).with(ArticleUpdate::IncrementReplies(1));
            match retry_transient(self.limits.propagation_retries, "propagate reply", || self.dispatcher.apply(&bump))
                .await
            {
                Ok(applied) => {
                    counted += 1;
                    next = applied.value.parent;
                }
                Err(err) => {
                    warn!(%child, %ancestor, error = %err, "reply propagation interrupted");
                    break;
                }
            }
        }
        debug!(%child, counted, "reply propagated");
        counted
    }

    async fn bump_index(&self, key: Identifier) {
        let bump = UpdateRequest::<Article>::new(key.clone()).with(ArticleUpdate::IncrementReplies(1));
        let result = retry_transient(self.limits.propagation_retries, "index", || {
            self.dispatcher.upsert(&bump, || Article::index(key.clone()))
        })
        .await;
        if let Err(err) = result {
            warn!(index = %key, error = %err, "index counter not updated");
        }
    }

    /// Best effort: unknown names are skipped, failures only logged.
    async fn notify_mentions(&self, author: &User, content: &str) {
        let mut seen = HashSet::new();
        for raw in extract_mentions(content, self.limits.max_mentions) {
            let name = sanitize_username(&raw);
            if name.is_empty() || name == author.id || !seen.insert(name.clone()) {
                continue;
            }
            let req = UpdateRequest::<User>::new(Identifier::user(&name)).with(UserUpdate::AddUnreadMentions(1));
            match self.dispatcher.apply(&req).await {
                Ok(_) => debug!(mention = %name, "mention delivered"),
                Err(DomainError::NotFound(..)) => debug!(mention = %name, "mentioned user does not exist"),
                Err(err) => warn!(mention = %name, error = %err, "mention not delivered"),
            }
        }
    }

    /// Direct replies in creation order. Children that cannot be read are
    /// skipped.
    pub async fn replies(&self, parent: &Identifier) -> Result<Vec<Article>> {
        let Some(found) = self.article(parent).await? else {
            return Err(DomainError::NotFound("article", parent.to_string()));
        };
        let mut out = Vec::with_capacity(found.children.len());
        for child in &found.children {
            match self.article(child).await? {
                Some(reply) => out.push(reply),
                None => warn!(%parent, %child, "linked reply is missing"),
            }
        }
        Ok(out)
    }

    async fn index_total(&self, key: &Identifier) -> Result<u32> {
        Ok(self.article(key).await?.map_or(0, |index| index.replies))
    }

    /// Top-level articles ever posted by `author`.
    pub async fn total_posts(&self, author: &str) -> Result<u32> {
        self.index_total(&Identifier::author(author)).await
    }

    pub async fn tag_total(&self, tag: &str) -> Result<u32> {
        self.index_total(&Identifier::tag(tag)).await
    }

    /// NSFW / lock / delete toggles, for the author or any moderator.
    #[instrument(skip_all, fields(actor = %actor.id, %id, ?action))]
    pub async fn moderate(&self, actor: &User, id: &Identifier, action: Moderation) -> Result<Article> {
        let Some(article) = self.article(id).await?.filter(|a| !a.is_index()) else {
            return Err(DomainError::NotFound("article", id.to_string()));
        };
        if article.author != actor.id && !actor.is_moderator() {
            return Err(DomainError::validation(format!("{} may not moderate {id}", actor.id)));
        }
        let applied = self.dispatcher.apply(&UpdateRequest::<Article>::new(id.clone()).with(action.update())).await?;
        if applied.changed {
            info!("moderation applied");
        }
        Ok(applied.value)
    }
}
