//! Argon2id implementation of `CredentialHasher`.
//!
//! The process secret is fed to Argon2 as its `secret` input (a pepper), so
//! a leaked password column is useless without the key.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use domains::{CredentialHasher, DomainError, Result};
use zeroize::Zeroizing;

/// Argon2 cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, iterations: 2, parallelism: 1 }
    }
}

pub struct Argon2Hasher {
    secret: Zeroizing<Vec<u8>>,
    params: Params,
}

impl Argon2Hasher {
    pub fn new(secret: &[u8], cost: HashCost) -> Result<Self> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| DomainError::validation(format!("argon2 params: {e}")))?;
        Ok(Self { secret: Zeroizing::new(secret.to_vec()), params })
    }

    fn argon(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(&self.secret, Algorithm::Argon2id, Version::V0x13, self.params.clone())
            .map_err(|e| DomainError::validation(format!("argon2 secret: {e}")))
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
            .map_err(|e| DomainError::unavailable(format!("salt: {e}")))?;
        let hash = self
            .argon()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| DomainError::unavailable(format!("argon2: {e}")))?;
        Ok(hash.to_string())
    }

    /// Any malformed stored hash counts as a mismatch.
    fn verify(&self, password: &str, hash: &str) -> bool {
        let parsed_hash = match PasswordHash::new(hash) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.argon() {
            Ok(argon) => argon.verify_password(password.as_bytes(), &parsed_hash).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: HashCost = HashCost { memory_kib: 64, iterations: 1, parallelism: 1 };

    #[test]
    fn hash_then_verify() {
        let h = Argon2Hasher::new(b"pepper-pepper-pepper", CHEAP).unwrap();
        let stored = h.hash("hunter2").unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(h.verify("hunter2", &stored));
        assert!(!h.verify("hunter3", &stored));
    }

    #[test]
    fn pepper_is_part_of_the_hash() {
        let a = Argon2Hasher::new(b"pepper-a-pepper-a", CHEAP).unwrap();
        let b = Argon2Hasher::new(b"pepper-b-pepper-b", CHEAP).unwrap();
        let stored = a.hash("hunter2").unwrap();
        assert!(!b.verify("hunter2", &stored));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        let h = Argon2Hasher::new(b"pepper-pepper-pepper", CHEAP).unwrap();
        assert!(!h.verify("x", ""));
        assert!(!h.verify("x", "not-a-phc-string"));
    }
}
