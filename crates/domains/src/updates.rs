//! # Update descriptors
//!
//! Every mutation of an aggregate is one variant of a closed, typed enum.
//! The dispatcher applies a list of them to a private copy of the current
//! aggregate; any rejected variant discards the whole copy.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{DomainError, Result};
use crate::ids::Identifier;
use crate::models::{Aggregate, Article, RelationSet, Role, User, KIMOCHI_MAX};

pub const EMAIL_MAX_CHARS: usize = 256;
pub const DESCRIPTION_MAX_CHARS: usize = 512;
pub const CUSTOM_NAME_MAX_CHARS: usize = 16;

/// An aggregate that can be patched by the dispatcher.
pub trait Mutable: Clone + Send + Sync + Sized + 'static {
    type Update: fmt::Debug + Clone + Send + Sync;

    const KIND: &'static str;

    /// Applies one update in place. Returns whether anything changed.
    fn apply(&mut self, update: &Self::Update) -> Result<bool>;

    fn from_aggregate(aggregate: Aggregate) -> Option<Self>;

    fn into_aggregate(self) -> Aggregate;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserUpdate {
    RotateSession(String),
    SetEmail(String),
    SetPasswordHash(String),
    SetLoginAt(DateTime<Utc>),
    RecordIp(String),
    /// Signed so that out-of-range input reaches the dispatcher intact.
    SetKimochi(i64),
    SetAutoNsfw(bool),
    SetFoldImages(bool),
    SetDescription(String),
    SetCustomName(String),
    SetAvatar(u32),
    SetRole(Role),
    SetBanned(bool),
    AdjustFollowers(i64),
    SetFollowers(u32),
    AddUnreadMentions(u32),
    ClearUnreadMentions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleUpdate {
    SetNsfw(bool),
    SetLocked(bool),
    MarkDeleted,
    /// Links a new reply. Rejected on locked or deleted parents.
    AppendChild(Identifier),
    IncrementReplies(u32),
    SetReplies(u32),
    AdjustLikes(i64),
    SetLikes(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationUpdate {
    Insert(String),
    Remove(String),
}

fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(DomainError::validation(format!("{field} longer than {max} characters")));
    }
    Ok(())
}

/// Counters saturate at both ends; drift is repaired by reconciliation.
fn adjust(counter: &mut u32, delta: i64) -> bool {
    let next = (i64::from(*counter) + delta).clamp(0, i64::from(u32::MAX)) as u32;
    set(counter, next)
}

impl Mutable for User {
    type Update = UserUpdate;

    const KIND: &'static str = "user";

    fn apply(&mut self, update: &UserUpdate) -> Result<bool> {
        Ok(match update {
            UserUpdate::RotateSession(nonce) => {
                if nonce.is_empty() {
                    return Err(DomainError::validation("session nonce must not be empty"));
                }
                set(&mut self.session, nonce.clone())
            }
            UserUpdate::SetEmail(email) => {
                check_len("email", email, EMAIL_MAX_CHARS)?;
                set(&mut self.email, email.clone())
            }
            UserUpdate::SetPasswordHash(hash) => {
                if hash.is_empty() {
                    return Err(DomainError::validation("password hash must not be empty"));
                }
                set(&mut self.password_hash, hash.clone())
            }
            UserUpdate::SetLoginAt(at) => set(&mut self.login_at, *at),
            UserUpdate::RecordIp(ip) => {
                self.recent_ips.push(ip.clone());
                true
            }
            UserUpdate::SetKimochi(k) => {
                let k = u8::try_from(*k)
                    .ok()
                    .filter(|k| *k <= KIMOCHI_MAX)
                    .ok_or_else(|| DomainError::validation(format!("kimochi {k} outside 0..={KIMOCHI_MAX}")))?;
                set(&mut self.kimochi, k)
            }
            UserUpdate::SetAutoNsfw(v) => set(&mut self.settings.auto_nsfw, *v),
            UserUpdate::SetFoldImages(v) => set(&mut self.settings.fold_images, *v),
            UserUpdate::SetDescription(text) => {
                check_len("description", text, DESCRIPTION_MAX_CHARS)?;
                set(&mut self.settings.description, text.clone())
            }
            UserUpdate::SetCustomName(name) => {
                check_len("custom name", name, CUSTOM_NAME_MAX_CHARS)?;
                set(&mut self.settings.custom_name, name.clone())
            }
            UserUpdate::SetAvatar(stamp) => set(&mut self.avatar, *stamp),
            UserUpdate::SetRole(role) => set(&mut self.role, *role),
            UserUpdate::SetBanned(v) => set(&mut self.banned, *v),
            UserUpdate::AdjustFollowers(delta) => adjust(&mut self.followers, *delta),
            UserUpdate::SetFollowers(n) => set(&mut self.followers, *n),
            UserUpdate::AddUnreadMentions(n) => adjust(&mut self.unread_mentions, i64::from(*n)),
            UserUpdate::ClearUnreadMentions => set(&mut self.unread_mentions, 0),
        })
    }

    fn from_aggregate(aggregate: Aggregate) -> Option<Self> {
        match aggregate {
            Aggregate::User(u) => Some(u),
            _ => None,
        }
    }

    fn into_aggregate(self) -> Aggregate {
        Aggregate::User(self)
    }
}

impl Mutable for Article {
    type Update = ArticleUpdate;

    const KIND: &'static str = "article";

    fn apply(&mut self, update: &ArticleUpdate) -> Result<bool> {
        Ok(match update {
            ArticleUpdate::SetNsfw(v) => set(&mut self.nsfw, *v),
            ArticleUpdate::SetLocked(v) => set(&mut self.locked, *v),
            ArticleUpdate::MarkDeleted => set(&mut self.deleted, true),
            ArticleUpdate::AppendChild(child) => {
                if self.locked || self.deleted {
                    return Err(DomainError::NotFound("article", self.id.to_string()));
                }
                if self.children.contains(child) {
                    false
                } else {
                    // Identifiers are time-ordered, so a sorted insert keeps
                    // late-arriving concurrent replies in creation order.
                    let at = self.children.partition_point(|c| c < child);
                    self.children.insert(at, child.clone());
                    true
                }
            }
            ArticleUpdate::IncrementReplies(n) => adjust(&mut self.replies, i64::from(*n)),
            ArticleUpdate::SetReplies(n) => set(&mut self.replies, *n),
            ArticleUpdate::AdjustLikes(delta) => adjust(&mut self.likes, *delta),
            ArticleUpdate::SetLikes(n) => set(&mut self.likes, *n),
        })
    }

    fn from_aggregate(aggregate: Aggregate) -> Option<Self> {
        match aggregate {
            Aggregate::Article(a) => Some(a),
            _ => None,
        }
    }

    fn into_aggregate(self) -> Aggregate {
        Aggregate::Article(self)
    }
}

impl Mutable for RelationSet {
    type Update = RelationUpdate;

    const KIND: &'static str = "relations";

    fn apply(&mut self, update: &RelationUpdate) -> Result<bool> {
        let changed = match update {
            RelationUpdate::Insert(m) => self.members.insert(m.clone()),
            RelationUpdate::Remove(m) => self.members.remove(m),
        };
        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    fn from_aggregate(aggregate: Aggregate) -> Option<Self> {
        match aggregate {
            Aggregate::Relations(r) => Some(r),
            _ => None,
        }
    }

    fn into_aggregate(self) -> Aggregate {
        Aggregate::Relations(self)
    }
}

/// A target plus the ordered updates to apply to it. Later updates in the
/// same request win over earlier ones touching the same field.
#[derive(Debug, Clone)]
pub struct UpdateRequest<M: Mutable> {
    pub target: Identifier,
    pub updates: Vec<M::Update>,
}

impl<M: Mutable> UpdateRequest<M> {
    pub fn new(target: Identifier) -> Self {
        Self { target, updates: Vec::new() }
    }

    pub fn with(mut self, update: M::Update) -> Self {
        self.updates.push(update);
        self
    }

    /// Runs every update against a copy of `current`. Nothing of the copy
    /// escapes unless all updates were accepted.
    pub fn apply_to(&self, current: &M) -> Result<(M, bool)> {
        let mut next = current.clone();
        let mut changed = false;
        for update in &self.updates {
            changed |= next.apply(update)?;
        }
        Ok((next, changed))
    }
}

/// Result of a dispatched request.
#[derive(Debug, Clone)]
pub struct Applied<M> {
    pub value: M,
    /// False when every update was a no-op and nothing was written.
    pub changed: bool,
    pub version: u64,
}
