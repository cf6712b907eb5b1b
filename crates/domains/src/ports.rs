//! # Core Traits (Ports)
//!
//! Adapters implement these to plug a backend into the services layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::Identifier;
use crate::models::{Aggregate, User, Versioned};

/// Authoritative persistence. A single logical service; every write is a
/// conditional write so that racing processes cannot lose updates.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>>;

    /// Stores `value` at [`Versioned::INITIAL`] unless the key exists.
    /// Returns false when it already existed.
    async fn create(&self, id: &Identifier, value: &Aggregate) -> Result<bool>;

    /// Stores `value` at `expected + 1` only if the current version is
    /// `expected`. Returns false on a version mismatch or a missing key.
    async fn compare_and_put(&self, id: &Identifier, expected: u64, value: &Aggregate) -> Result<bool>;
}

/// Fast, possibly stale, possibly evicting read tier.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>>;

    async fn set(&self, id: &Identifier, value: &Versioned) -> Result<()>;

    async fn invalidate(&self, id: &Identifier) -> Result<()>;
}

/// What a verified session token proves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub session: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// A captcha challenge: `id` is handed back on submit, `text` is what the
/// presentation layer renders for the human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub text: String,
}

/// Stateless signed credentials.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait TokenCodec: Send + Sync {
    fn make_user_token(&self, user: &User) -> String;

    /// Fails closed with `Forged` on any malformed, tampered or expired input.
    fn verify_user_token(&self, token: &str) -> Result<SessionClaims>;

    /// `context` binds the challenge to the requester (e.g. hashed IP).
    fn make_challenge(&self, context: &str) -> Challenge;

    fn verify_challenge(&self, challenge_id: &str, answer: &str, context: &str) -> Result<()>;
}

/// Keyed one-way password hashing.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String>;

    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// The slice of an incoming request the core needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Raw value of the session cookie, if any
    pub session_token: Option<String>,
    pub ip: String,
}
