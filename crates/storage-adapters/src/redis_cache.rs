//! Redis implementation of `CacheTier` (feature `redis`).
//!
//! Key pattern: `{prefix}{identifier}` → JSON of `Versioned`, with `EX ttl`.
//! Undecodable entries are treated as misses and deleted. Writes go through
//! a script that compares versions server-side, so a slow reader filling a
//! miss can never replace a newer entry written through meanwhile.

use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, Script};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use domains::{CacheTier, DomainError, Identifier, Result, Versioned};
use tracing::{debug, warn};

/// KEYS[1] entry; ARGV[1] JSON, ARGV[2] its version, ARGV[3] ttl seconds.
/// Returns 1 when written, 0 when an equal or newer version is cached.
const SET_IF_NEWER: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and type(decoded) == 'table' and tonumber(decoded['version']) and
        tonumber(decoded['version']) > tonumber(ARGV[2]) then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
return 1
"#;

pub struct RedisCache {
    pool: Pool,
    ttl_secs: u64,
    prefix: String,
    set_if_newer: Script,
}

fn fault<E: std::fmt::Display>(err: E) -> DomainError {
    DomainError::unavailable(format!("redis: {err}"))
}

impl RedisCache {
    pub fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1)).map_err(fault)?;
        Ok(Self {
            pool,
            ttl_secs: ttl_secs.max(1),
            prefix: "iis:".to_string(),
            set_if_newer: Script::new(SET_IF_NEWER),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, id: &Identifier) -> String {
        format!("{}{}", self.prefix, id)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(fault)
    }
}

#[async_trait]
impl CacheTier for RedisCache {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>> {
        let key = self.key(id);
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(&key).await.map_err(fault)?;
        let Some(raw) = raw else { return Ok(None) };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(%id, error = %err, "dropping undecodable cache entry");
                conn.del::<_, ()>(&key).await.map_err(fault)?;
                Ok(None)
            }
        }
    }

    async fn set(&self, id: &Identifier, value: &Versioned) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn().await?;
        let written: i32 = self
            .set_if_newer
            .key(self.key(id))
            .arg(json)
            .arg(value.version)
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(fault)?;
        if written == 0 {
            debug!(%id, version = value.version, "newer entry already cached");
        }
        Ok(())
    }

    async fn invalidate(&self, id: &Identifier) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(id)).await.map_err(fault)
    }
}
