//! Builds a full `ForumCore` over the in-memory backends with the real
//! token codec and password hasher.

#![allow(dead_code)]

use std::sync::Arc;

use auth_adapters::{Argon2Hasher, HashCost, HmacTokenCodec, TokenPolicy};
use domains::{RequestContext, User};
use services::{CoreDeps, ForumCore, Limits, Signup};
use storage_adapters::{MemoryCache, MemoryDurableStore};

pub const KEY: &[u8] = b"integration-test-signing-key-0123";
pub const IP: &str = "10.0.0.7";
pub const PASSWORD: &str = "hunter22";

pub struct Harness {
    pub core: Arc<ForumCore>,
    pub durable: Arc<MemoryDurableStore>,
}

pub fn cheap_hasher() -> Argon2Hasher {
    Argon2Hasher::new(b"pepper", HashCost { memory_kib: 1024, iterations: 1, parallelism: 1 }).unwrap()
}

pub fn harness() -> Harness {
    harness_with(Limits::default())
}

pub fn harness_with(limits: Limits) -> Harness {
    let durable = Arc::new(MemoryDurableStore::new());
    let core = ForumCore::new(CoreDeps {
        durable: durable.clone(),
        cache: Arc::new(MemoryCache::default()),
        tokens: Arc::new(HmacTokenCodec::new(KEY, TokenPolicy::default()).unwrap()),
        hasher: Arc::new(cheap_hasher()),
        ip_key: b"ip-key".to_vec(),
        admin_name: "root".to_string(),
        limits,
    })
    .unwrap();
    Harness { core: Arc::new(core), durable }
}

pub fn ctx(token: Option<&str>) -> RequestContext {
    RequestContext { session_token: token.map(str::to_string), ip: IP.to_string() }
}

/// Signs `name` up by answering the captcha the way a browser would.
pub async fn signup(core: &ForumCore, name: &str) -> (User, String) {
    let challenge = core.accounts.new_captcha(&ctx(None));
    core.accounts
        .signup(Signup {
            username: name.to_string(),
            email: format!("{name}@example.invalid"),
            password: PASSWORD.to_string(),
            ip: IP.to_string(),
            challenge_id: challenge.id,
            challenge_answer: challenge.text,
        })
        .await
        .unwrap()
}
