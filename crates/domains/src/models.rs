//! # Domain Models
//!
//! The aggregates of the forum core. Each one is the unit of atomic update:
//! created once, then only mutated through typed update descriptors, never
//! replaced wholesale and never physically deleted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{Category, Identifier};
use crate::ip_history::IpHistory;

/// Upper bound (inclusive) of the mood byte.
pub const KIMOCHI_MAX: u8 = 44;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub auto_nsfw: bool,
    pub fold_images: bool,
    pub description: String,
    pub custom_name: String,
}

/// A registered account. `id` is the case-normalised username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Rotated on login/logout; every token signed with an older nonce dies.
    pub session: String,
    pub email: String,
    /// PHC string of a keyed hash. Never empty after signup.
    pub password_hash: String,
    pub recent_ips: IpHistory,
    pub signup_at: DateTime<Utc>,
    pub login_at: DateTime<Utc>,
    pub kimochi: u8,
    pub settings: UserSettings,
    /// Unix seconds of the last avatar upload, 0 when none
    pub avatar: u32,
    pub role: Role,
    pub banned: bool,
    pub followers: u32,
    pub unread_mentions: u32,
}

impl User {
    pub fn key(&self) -> Identifier {
        Identifier::user(&self.id)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_moderator(&self) -> bool {
        matches!(self.role, Role::Moderator | Role::Admin)
    }

    pub fn display_name(&self) -> &str {
        if self.settings.custom_name.is_empty() {
            &self.id
        } else {
            &self.settings.custom_name
        }
    }
}

/// A post, a reply, or an index record (author / tag timelines reuse the
/// article shape and keep their totals in `replies`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: Identifier,
    /// None for top-level posts and index records
    pub parent: Option<Identifier>,
    pub author: String,
    pub content: String,
    pub ip_hash: String,
    pub nsfw: bool,
    pub locked: bool,
    pub deleted: bool,
    /// Direct and indirect descendants whose creation succeeded
    pub replies: u32,
    pub likes: u32,
    /// Direct children in creation order
    pub children: Vec<Identifier>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Article {
    pub fn new(id: Identifier, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            parent: None,
            author: author.into(),
            content: content.into(),
            ip_hash: String::new(),
            nsfw: false,
            locked: false,
            deleted: false,
            replies: 0,
            likes: 0,
            children: Vec::new(),
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// An empty counter record for the author/tag indexes.
    pub fn index(id: Identifier) -> Self {
        Self::new(id, "", "")
    }

    pub fn is_index(&self) -> bool {
        matches!(self.id.category(), Category::Author | Category::Tag)
    }
}

/// One side of a relationship: every member `m` of the set with key
/// `(category, subject)` is an edge `subject -> m`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSet {
    pub id: Identifier,
    pub members: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl RelationSet {
    pub fn empty(id: Identifier) -> Self {
        Self { id, members: BTreeSet::new(), updated_at: Utc::now() }
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Everything the store can hold under an [`Identifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Aggregate {
    User(User),
    Article(Article),
    Relations(RelationSet),
}

impl Aggregate {
    pub fn kind(&self) -> &'static str {
        match self {
            Aggregate::User(_) => "user",
            Aggregate::Article(_) => "article",
            Aggregate::Relations(_) => "relations",
        }
    }
}

/// An aggregate as persisted: the durable store bumps `version` on every
/// successful write and uses it for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: Aggregate,
}

impl Versioned {
    pub const INITIAL: u64 = 1;

    pub fn new(version: u64, value: Aggregate) -> Self {
        Self { version, value }
    }
}
