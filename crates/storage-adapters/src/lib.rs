//! # storage-adapters
//!
//! Backends for the `DurableStore` and `CacheTier` ports.
//! The in-memory pair is always compiled; Redis and Postgres are opt-in.

pub mod memory;
#[cfg(feature = "db-postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use memory::{MemoryCache, MemoryDurableStore};
#[cfg(feature = "db-postgres")]
pub use postgres::PgDurableStore;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
