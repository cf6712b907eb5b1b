//! # Identifiers
//!
//! Typed, self-describing, URL-safe keys for every aggregate.
//!
//! String form: `<tag>.<scope>.<suffix>`
//!
//! - `tag` is one ASCII letter naming the [`Category`].
//! - `scope` is base64url (no padding) of the owner scope, so it can never
//!   contain the `.` separator.
//! - `suffix` is empty for deterministic categories and a fixed-width,
//!   time-ordered hex string for chronological ones, so that plain string
//!   comparison follows creation order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Low bits of the monotonic state reserved for the per-second counter.
const COUNTER_BITS: u32 = 20;
const STATE_HEX_WIDTH: usize = 14;
const NODE_HEX_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    User,
    Article,
    /// Per-tag timeline index
    Tag,
    /// Per-author post index ("total posts by author")
    Author,
    Following,
    Followers,
    Blocking,
    Liking,
    Likers,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::User,
        Category::Article,
        Category::Tag,
        Category::Author,
        Category::Following,
        Category::Followers,
        Category::Blocking,
        Category::Liking,
        Category::Likers,
    ];

    pub const fn tag(self) -> char {
        match self {
            Category::User => 'u',
            Category::Article => 'a',
            Category::Tag => 't',
            Category::Author => 'w',
            Category::Following => 'f',
            Category::Followers => 'r',
            Category::Blocking => 'b',
            Category::Liking => 'l',
            Category::Likers => 'k',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }

    /// Categories whose identifiers must sort by creation time.
    pub const fn is_chronological(self) -> bool {
        matches!(self, Category::Article)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An opaque aggregate key. Ordering is plain string ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    raw: String,
    category: Category,
}

impl Identifier {
    fn compose(category: Category, scope: &str, suffix: &str) -> Self {
        let raw = format!("{}.{}.{}", category.tag(), URL_SAFE_NO_PAD.encode(scope), suffix);
        Self { raw, category }
    }

    /// Deterministic identifier for a category that does not need ordering.
    pub fn scoped(category: Category, scope: &str) -> Self {
        Self::compose(category, scope, "")
    }

    /// The storage key of a user. `name` must already be normalised.
    pub fn user(name: &str) -> Self {
        Self::scoped(Category::User, name)
    }

    pub fn author(user_id: &str) -> Self {
        Self::scoped(Category::Author, user_id)
    }

    pub fn tag(tag: &str) -> Self {
        Self::scoped(Category::Tag, tag)
    }

    /// Relationship-set key from a method name as collaborators send it
    /// (`follow`, `block`, `like`).
    pub fn relation_for(method: &str, subject: &str) -> Result<Self> {
        let category = match method {
            "follow" => Category::Following,
            "block" => Category::Blocking,
            "like" => Category::Liking,
            other => return Err(DomainError::validation(format!("unknown relationship method {other:?}"))),
        };
        Ok(Self::scoped(category, subject))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || DomainError::validation(format!("malformed identifier {raw:?}"));

        let mut parts = raw.splitn(3, '.');
        let (tag, scope, suffix) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(s), Some(x)) => (t, s, x),
            _ => return Err(invalid()),
        };

        let mut chars = tag.chars();
        let category = match (chars.next(), chars.next()) {
            (Some(c), None) => Category::from_tag(c).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };

        let scope = URL_SAFE_NO_PAD.decode(scope).map_err(|_| invalid())?;
        String::from_utf8(scope).map_err(|_| invalid())?;

        let suffix_ok = if category.is_chronological() {
            suffix.len() == STATE_HEX_WIDTH + NODE_HEX_WIDTH
                && suffix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        } else {
            suffix.is_empty()
        };
        if !suffix_ok {
            return Err(invalid());
        }

        Ok(Self { raw: raw.to_string(), category })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Decoded owner scope. Empty for top-level articles.
    pub fn scope(&self) -> String {
        self.raw
            .split('.')
            .nth(1)
            .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default()
    }

    pub fn suffix(&self) -> &str {
        self.raw.splitn(3, '.').nth(2).unwrap_or_default()
    }

    /// Creation second embedded in a chronological identifier.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        if !self.category.is_chronological() {
            return None;
        }
        let state = u64::from_str_radix(self.suffix().get(..STATE_HEX_WIDTH)?, 16).ok()?;
        Utc.timestamp_opt((state >> COUNTER_BITS) as i64, 0).single()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Identifier {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.raw
    }
}

/// Allocates identifiers. Chronological categories draw from a monotonic
/// `(seconds << 20) | counter` state; the counter carries into the seconds
/// field on overflow, so values never repeat or go backwards even when the
/// wall clock does.
#[derive(Debug)]
pub struct IdGenerator {
    state: AtomicU64,
    node: u32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// A generator with random node entropy, distinguishing processes that
    /// allocate in the same second.
    pub fn new() -> Self {
        Self::with_node(rand::random::<u32>())
    }

    pub fn with_node(node: u32) -> Self {
        Self { state: AtomicU64::new(0), node }
    }

    pub fn new_id(&self, category: Category, scope: &str) -> Identifier {
        if category.is_chronological() {
            Identifier::compose(category, scope, &self.next_suffix())
        } else {
            Identifier::scoped(category, scope)
        }
    }

    pub fn next_article(&self) -> Identifier {
        self.new_id(Category::Article, "")
    }

    fn next_suffix(&self) -> String {
        let floor = (Utc::now().timestamp().max(0) as u64) << COUNTER_BITS;
        let step = |prev: u64| floor.max(prev + 1);
        let prev = match self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(step(p))) {
            Ok(p) | Err(p) => p,
        };
        format!(
            "{:0sw$x}{:0nw$x}",
            step(prev),
            self.node,
            sw = STATE_HEX_WIDTH,
            nw = NODE_HEX_WIDTH
        )
    }
}
