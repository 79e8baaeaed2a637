//! Database liveness.

use anyhow::{Result, bail};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};

/// Answers whether the primary database can serve queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct PgDatabaseProbe {
    pool: Pool<Postgres>,
}

impl PgDatabaseProbe {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseProbe for PgDatabaseProbe {
    async fn ping(&self) -> Result<()> {
        let result: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if result != 1 {
            bail!("unexpected liveness query result: {}", result);
        }
        Ok(())
    }
}
