//! HMAC-SHA256 implementation of `TokenCodec`.
//!
//! Wire form of every token: `base64url(payload_json) "." base64url(mac)`.
//! The MAC covers a purpose label plus the encoded payload, so a captcha id
//! can never be replayed as a session cookie or vice versa.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use domains::{Challenge, DomainError, Result, SessionClaims, TokenCodec, User};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::replay::ReplayGuard;

type HmacSha256 = Hmac<Sha256>;

const PURPOSE_SESSION: &[u8] = b"session\0";
const PURPOSE_CHALLENGE: &[u8] = b"challenge\0";
const PURPOSE_ANSWER: &[u8] = b"answer\0";

pub const MIN_KEY_LEN: usize = 16;

/// Lifetimes and shape of issued tokens.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub session_ttl_secs: i64,
    pub challenge_ttl_secs: i64,
    pub challenge_length: usize,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            session_ttl_secs: 365 * 86400,
            challenge_ttl_secs: 300,
            challenge_length: 4,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengeClaims {
    nonce: String,
    /// Keyed digest of nonce, answer and context
    digest: String,
    expires_at: i64,
}

pub struct HmacTokenCodec {
    mac: HmacSha256,
    policy: TokenPolicy,
    replay: ReplayGuard,
}

impl HmacTokenCodec {
    pub fn new(key: &[u8], policy: TokenPolicy) -> Result<Self> {
        if key.len() < MIN_KEY_LEN {
            return Err(DomainError::validation(format!("signing key shorter than {MIN_KEY_LEN} bytes")));
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|e| DomainError::validation(e.to_string()))?;
        Ok(Self { mac, policy, replay: ReplayGuard::default() })
    }

    fn sign(&self, purpose: &[u8], payload: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(purpose);
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn seal<T: Serialize>(&self, purpose: &[u8], claims: &T) -> String {
        // Serializing plain structs of strings and integers cannot fail.
        let json = serde_json::to_vec(claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let sig = URL_SAFE_NO_PAD.encode(self.sign(purpose, &payload));
        format!("{payload}.{sig}")
    }

    fn open<T: DeserializeOwned>(&self, purpose: &[u8], token: &str) -> Result<T> {
        let (payload, sig) = token
            .split_once('.')
            .ok_or_else(|| DomainError::forged("token has no signature"))?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| DomainError::forged("signature is not base64url"))?;

        let mut mac = self.mac.clone();
        mac.update(purpose);
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| DomainError::forged("signature mismatch"))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| DomainError::forged("payload is not base64url"))?;
        serde_json::from_slice(&json).map_err(|_| DomainError::forged("payload is malformed"))
    }

    fn answer_mac(&self, nonce: &str, answer: &str, context: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(PURPOSE_ANSWER);
        for part in [nonce, answer.trim(), context] {
            mac.update(&(part.len() as u64).to_be_bytes());
            mac.update(part.as_bytes());
        }
        mac
    }

    pub(crate) fn verify_user_token_at(&self, token: &str, now: i64) -> Result<SessionClaims> {
        let claims: SessionClaims = self.open(PURPOSE_SESSION, token)?;
        if claims.user_id.is_empty() || claims.session.is_empty() {
            return Err(DomainError::forged("session claims are incomplete"));
        }
        if claims.expires_at < now {
            return Err(DomainError::forged("session token expired"));
        }
        Ok(claims)
    }

    pub(crate) fn verify_challenge_at(&self, challenge_id: &str, answer: &str, context: &str, now: i64) -> Result<()> {
        let claims: ChallengeClaims = self.open(PURPOSE_CHALLENGE, challenge_id)?;
        if claims.expires_at < now {
            return Err(DomainError::forged("challenge expired"));
        }
        let received = URL_SAFE_NO_PAD
            .decode(&claims.digest)
            .map_err(|_| DomainError::forged("challenge digest is not base64url"))?;
        self.answer_mac(&claims.nonce, answer, context)
            .verify_slice(&received)
            .map_err(|_| DomainError::forged("wrong captcha answer"))?;
        if !self.replay.consume(&claims.nonce, claims.expires_at, now) {
            return Err(DomainError::forged("challenge already used"));
        }
        Ok(())
    }
}

impl TokenCodec for HmacTokenCodec {
    fn make_user_token(&self, user: &User) -> String {
        let claims = SessionClaims {
            user_id: user.id.clone(),
            session: user.session.clone(),
            expires_at: Utc::now().timestamp() + self.policy.session_ttl_secs,
        };
        self.seal(PURPOSE_SESSION, &claims)
    }

    fn verify_user_token(&self, token: &str) -> Result<SessionClaims> {
        self.verify_user_token_at(token, Utc::now().timestamp())
            .inspect_err(|e| debug!(error = %e, "rejected session token"))
    }

    fn make_challenge(&self, context: &str) -> Challenge {
        let nonce = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 12]>());
        let text: String = (0..self.policy.challenge_length.max(1))
            .map(|_| char::from(b'0' + rand::random::<u8>() % 10))
            .collect();
        let claims = ChallengeClaims {
            digest: URL_SAFE_NO_PAD.encode(self.answer_mac(&nonce, &text, context).finalize().into_bytes()),
            nonce,
            expires_at: Utc::now().timestamp() + self.policy.challenge_ttl_secs,
        };
        Challenge { id: self.seal(PURPOSE_CHALLENGE, &claims), text }
    }

    fn verify_challenge(&self, challenge_id: &str, answer: &str, context: &str) -> Result<()> {
        self.verify_challenge_at(challenge_id, answer, context, Utc::now().timestamp())
    }
}
