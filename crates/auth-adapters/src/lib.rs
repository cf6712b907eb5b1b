//! # auth-adapters
//!
//! Credential handling for the forum core: HMAC-signed session tokens and
//! captcha challenges, plus peppered Argon2id password hashing.

pub mod password;
pub mod replay;
pub mod tokens;

pub use password::{Argon2Hasher, HashCost};
pub use replay::ReplayGuard;
pub use tokens::{HmacTokenCodec, TokenPolicy, MIN_KEY_LEN};
