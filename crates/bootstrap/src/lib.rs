//! # bootstrap
//!
//! Process wiring shared by the binaries: tracing setup and assembly of a
//! [`ForumCore`] from loaded [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use auth_adapters::{Argon2Hasher, HashCost, HmacTokenCodec, TokenPolicy};
use configs::{LogSettings, Settings, StoreBackend, StoreSettings};
use domains::{CacheTier, DurableStore};
use services::{CoreDeps, ForumCore, Limits};
use storage_adapters::{MemoryCache, MemoryDurableStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `log.level`.
pub fn init_tracing(log: &LogSettings) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level).context("invalid log.level directive")?,
    };
    let registry = tracing_subscriber::registry().with(env_filter);

    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

pub fn limits(settings: &Settings) -> Limits {
    let l = &settings.limits;
    Limits {
        max_mentions: l.max_mentions,
        max_tags: l.max_tags,
        propagation_retries: l.propagation_retries,
        max_thread_depth: l.max_thread_depth,
        cas_retries: l.cas_retries,
    }
}

pub async fn durable_store(store: &StoreSettings) -> anyhow::Result<Arc<dyn DurableStore>> {
    match store.backend {
        StoreBackend::Memory => {
            warn!("memory backend selected; nothing survives a restart");
            Ok(Arc::new(MemoryDurableStore::new()))
        }
        StoreBackend::Postgres => postgres(store).await,
    }
}

#[cfg(feature = "db-postgres")]
async fn postgres(store: &StoreSettings) -> anyhow::Result<Arc<dyn DurableStore>> {
    let url = store.database_url.as_deref().context("store.database_url is not set")?;
    let pg = storage_adapters::PgDurableStore::connect(url, store.max_connections)
        .await
        .context("connecting to postgres")?;
    pg.ensure_schema().await.context("preparing aggregates table")?;
    info!("postgres durable store ready");
    Ok(Arc::new(pg))
}

#[cfg(not(feature = "db-postgres"))]
async fn postgres(_: &StoreSettings) -> anyhow::Result<Arc<dyn DurableStore>> {
    anyhow::bail!("store.backend = \"postgres\" needs a build with the db-postgres feature")
}

pub fn cache_tier(store: &StoreSettings) -> anyhow::Result<Arc<dyn CacheTier>> {
    match store.redis_url.as_deref() {
        Some(url) => redis(url, store.cache_ttl_secs),
        None => Ok(Arc::new(MemoryCache::new(Duration::from_secs(store.cache_ttl_secs), store.cache_capacity))),
    }
}

#[cfg(feature = "redis")]
fn redis(url: &str, ttl_secs: u64) -> anyhow::Result<Arc<dyn CacheTier>> {
    let cache = storage_adapters::RedisCache::connect(url, ttl_secs).context("creating redis pool")?;
    info!("redis cache tier configured");
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
fn redis(_: &str, _: u64) -> anyhow::Result<Arc<dyn CacheTier>> {
    anyhow::bail!("store.redis_url is set but this build lacks the redis feature")
}

/// Builds every adapter the settings ask for and hands them to the core.
pub async fn build_core(settings: &Settings) -> anyhow::Result<ForumCore> {
    if settings.uses_development_key() {
        warn!("secret_key is the public development key; tokens are forgeable");
    }
    let policy = TokenPolicy {
        session_ttl_secs: settings.tokens.session_ttl_secs,
        challenge_ttl_secs: settings.tokens.challenge_ttl_secs,
        challenge_length: settings.tokens.challenge_length,
    };
    let cost = HashCost {
        memory_kib: settings.password.memory_kib,
        iterations: settings.password.iterations,
        parallelism: settings.password.parallelism,
    };

    let deps = CoreDeps {
        durable: durable_store(&settings.store).await?,
        cache: cache_tier(&settings.store)?,
        tokens: Arc::new(HmacTokenCodec::new(settings.secret_bytes(), policy).context("token codec")?),
        hasher: Arc::new(Argon2Hasher::new(settings.secret_bytes(), cost).context("password hasher")?),
        ip_key: settings.secret_bytes().to_vec(),
        admin_name: settings.admin_name.clone(),
        limits: limits(settings),
    };
    let core = ForumCore::new(deps).context("assembling forum core")?;
    info!(backend = ?settings.store.backend, "forum core ready");
    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_settings_build_a_working_core() {
        let settings = Settings::from_toml(
            r#"
            secret_key = "a-very-long-secret-key"
            [limits]
            max_tags = 2
            "#,
        )
        .unwrap();
        assert_eq!(limits(&settings).max_tags, 2);

        let core = build_core(&settings).await.unwrap();
        assert!(core.get_user("nobody").await.unwrap().is_none());
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_url_without_feature_is_an_error() {
        let store = StoreSettings { redis_url: Some("redis://localhost".into()), ..StoreSettings::default() };
        assert!(cache_tier(&store).is_err());
    }
}
