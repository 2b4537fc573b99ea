//! Storage abstraction over PostgreSQL.
//!
//! Managers hold a [`Store`] and open explicit transactions for every
//! mutating pipeline; a transaction maps to one pooled connection held
//! until commit or rollback.

pub mod dialect;

use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{LedgerError, Result};

pub type PgTx<'a> = Transaction<'a, Postgres>;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    schema: String,
}

impl Store {
    pub async fn connect(database_url: &str, schema: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn from_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Qualify a table name with the configured schema.
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    /// Check a single connection out of the pool, for callers that issue
    /// plain statements without a transaction.
    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn begin(&self) -> Result<PgTx<'static>> {
        Ok(self.pool.begin().await?)
    }

    /// Take a transaction-scoped advisory lock; released at commit/rollback.
    pub async fn advisory_lock(&self, tx: &mut PgTx<'_>, key: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Liveness probe used by the /health route.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// Derive a 64-bit advisory lock key from a string identity such as
/// `"ledger:holder:type"`. Collisions only cost extra serialization, never
/// correctness.
pub fn advisory_key(identity: &str) -> i64 {
    let digest = Sha256::digest(identity.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

pub fn is_unique_violation(err: &LedgerError) -> bool {
    matches!(err, LedgerError::AlreadyExists(_))
}

pub fn is_serialization_failure(err: &LedgerError) -> bool {
    matches!(err, LedgerError::Conflict(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_and_distinct() {
        let a = advisory_key("ledger-1:holder-1:individual");
        let b = advisory_key("ledger-1:holder-1:individual");
        let c = advisory_key("ledger-1:holder-2:individual");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn advisory_key_matches_sha256_prefix() {
        let key = advisory_key("x");
        let digest = Sha256::digest(b"x");
        let expected = i64::from_be_bytes(digest[..8].try_into().unwrap());
        assert_eq!(key, expected);
    }
}
