//! # Postgres `DurableStore` (feature `db-postgres`)
//!
//! One row per aggregate: `id TEXT PRIMARY KEY`, a `version` counter used
//! for compare-and-swap, and the aggregate itself as JSONB.

use async_trait::async_trait;
use domains::{Aggregate, DomainError, DurableStore, Identifier, Result, Versioned};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS aggregates (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    version     BIGINT NOT NULL,
    body        JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

fn fault(err: sqlx::Error) -> DomainError {
    DomainError::unavailable(format!("postgres: {err}"))
}

pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(fault)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await.map_err(fault)?;
        info!("aggregates table ready");
        Ok(())
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn get(&self, id: &Identifier) -> Result<Option<Versioned>> {
        let row = sqlx::query("SELECT version, body FROM aggregates WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(fault)?;

        let Some(row) = row else { return Ok(None) };
        let version: i64 = row.try_get("version").map_err(fault)?;
        let Json(value): Json<Aggregate> = row.try_get("body").map_err(fault)?;
        Ok(Some(Versioned::new(version as u64, value)))
    }

    async fn create(&self, id: &Identifier, value: &Aggregate) -> Result<bool> {
        let done = sqlx::query(
            "INSERT INTO aggregates (id, kind, version, body) VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(value.kind())
        .bind(Versioned::INITIAL as i64)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .map_err(fault)?;
        Ok(done.rows_affected() == 1)
    }

    async fn compare_and_put(&self, id: &Identifier, expected: u64, value: &Aggregate) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE aggregates SET body = $3, version = version + 1, updated_at = now() \
             WHERE id = $1 AND version = $2",
        )
        .bind(id.as_str())
        .bind(expected as i64)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .map_err(fault)?;
        Ok(done.rows_affected() == 1)
    }
}
